use std::path::Path;
use std::path::PathBuf;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;

use gateway_core::GatewayErr;
use gateway_core::history::HistoryResolver;
use gateway_core::history::encode_project_path;
use gateway_core::history::session_file;
use gateway_protocol::rpc::LoadHistoryParams;

struct HistoryFixture {
    resolver: HistoryResolver,
    project: PathBuf,
    _tmp: tempfile::TempDir,
}

fn fixture() -> HistoryFixture {
    let tmp = tempfile::tempdir().expect("tempdir");
    let claude_home = tmp.path().join("claude-home");
    let project = tmp.path().join("proj");
    std::fs::create_dir_all(&project).expect("mkdir project");
    HistoryFixture {
        resolver: HistoryResolver::new(claude_home),
        project,
        _tmp: tmp,
    }
}

fn write_session(resolver: &HistoryResolver, project: &Path, session_id: &str, lines: &[String]) {
    let path = session_file(resolver.claude_home(), project, session_id);
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir history");
    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    std::fs::write(path, content).expect("write session file");
}

fn user_record(uuid: &str, ts: &str, text: &str) -> String {
    format!(
        r#"{{"type":"user","uuid":"{uuid}","timestamp":"{ts}","message":{{"content":"{text}"}}}}"#
    )
}

fn assistant_record(uuid: &str, ts: &str, text: &str) -> String {
    format!(
        r#"{{"type":"assistant","uuid":"{uuid}","timestamp":"{ts}","message":{{"content":[{{"type":"text","text":"{text}"}}]}}}}"#
    )
}

fn load_params(session_id: &str, project: &Path, offset: usize, limit: usize) -> LoadHistoryParams {
    LoadHistoryParams {
        session_id: Some(session_id.to_string()),
        project_path: Some(project.to_path_buf()),
        offset,
        limit,
    }
}

#[tokio::test]
async fn paging_windows_concatenate() {
    let fixture = fixture();
    let lines: Vec<String> = (0..100)
        .map(|i| user_record(&format!("u{i}"), "2026-07-01T10:00:00Z", &format!("m{i}")))
        .collect();
    write_session(&fixture.resolver, &fixture.project, "s1", &lines);

    let first = fixture
        .resolver
        .load(&load_params("s1", &fixture.project, 0, 30))
        .await
        .expect("first window");
    let second = fixture
        .resolver
        .load(&load_params("s1", &fixture.project, 30, 30))
        .await
        .expect("second window");
    let combined = fixture
        .resolver
        .load(&load_params("s1", &fixture.project, 0, 60))
        .await
        .expect("combined window");

    assert_eq!(first.count, 30);
    assert_eq!(second.count, 30);
    assert_eq!(first.available_count, 100);
    let mut glued = first.messages.clone();
    glued.extend(second.messages.clone());
    assert_eq!(glued, combined.messages);
}

#[tokio::test]
async fn offset_beyond_the_end_returns_empty_window() {
    let fixture = fixture();
    let lines: Vec<String> = (0..10)
        .map(|i| user_record(&format!("u{i}"), "2026-07-01T10:00:00Z", "m"))
        .collect();
    write_session(&fixture.resolver, &fixture.project, "s1", &lines);

    let window = fixture
        .resolver
        .load(&load_params("s1", &fixture.project, 10, 5))
        .await
        .expect("window");
    assert_eq!(window.count, 0);
    assert_eq!(window.available_count, 10);
}

#[tokio::test]
async fn compaction_is_detected_and_fresh_data_served() {
    let fixture = fixture();
    let lines: Vec<String> = (0..1000)
        .map(|i| user_record(&format!("u{i}"), "2026-07-01T10:00:00Z", &format!("m{i}")))
        .collect();
    write_session(&fixture.resolver, &fixture.project, "s1", &lines);

    let first = fixture
        .resolver
        .load(&load_params("s1", &fixture.project, 0, 200))
        .await
        .expect("pre-compaction read");
    assert_eq!(first.count, 200);
    assert_eq!(first.available_count, 1000);
    assert!(!first.compacted);

    // The CLI rewrites the file smaller, as a compaction does.
    let compacted: Vec<String> = (0..300)
        .map(|i| user_record(&format!("c{i}"), "2026-07-01T11:00:00Z", &format!("n{i}")))
        .collect();
    write_session(&fixture.resolver, &fixture.project, "s1", &compacted);

    let second = fixture
        .resolver
        .load(&load_params("s1", &fixture.project, 200, 200))
        .await
        .expect("post-compaction read");
    assert!(second.compacted, "compaction must be flagged");
    assert_eq!(second.count, 100);
    assert_eq!(second.available_count, 300);
    // Fresh records, not the stale cached tail.
    assert_eq!(second.messages[0]["uuid"], "c200");
}

#[tokio::test]
async fn leaf_uuid_links_merge_files_in_emission_order() {
    let fixture = fixture();
    // The requested session links (via leafUuid) to a record kept in an
    // older peer file.
    write_session(
        &fixture.resolver,
        &fixture.project,
        "old",
        &[
            user_record("o1", "2026-07-01T09:00:00Z", "old question"),
            assistant_record("o2", "2026-07-01T09:00:10Z", "old answer"),
        ],
    );
    write_session(
        &fixture.resolver,
        &fixture.project,
        "new",
        &[
            r#"{"type":"summary","summary":"continued","leafUuid":"o2","uuid":"n0","timestamp":"2026-07-01T10:00:00Z"}"#
                .to_string(),
            user_record("n1", "2026-07-01T10:00:01Z", "new question"),
        ],
    );
    // Unrelated session that must not be merged.
    write_session(
        &fixture.resolver,
        &fixture.project,
        "unrelated",
        &[user_record("x1", "2026-07-01T08:00:00Z", "noise")],
    );

    let loaded = fixture
        .resolver
        .load(&load_params("new", &fixture.project, 0, 100))
        .await
        .expect("linked load");

    let uuids: Vec<&str> = loaded
        .messages
        .iter()
        .map(|m| m["uuid"].as_str().expect("uuid"))
        .collect();
    assert_eq!(uuids, vec!["o1", "o2", "n0", "n1"]);
    assert_eq!(loaded.available_count, 4);
}

#[tokio::test]
async fn load_by_session_id_alone_scans_projects() {
    let fixture = fixture();
    write_session(
        &fixture.resolver,
        &fixture.project,
        "roaming",
        &[user_record("u1", "2026-07-01T10:00:00Z", "found me")],
    );

    let loaded = fixture
        .resolver
        .load(&LoadHistoryParams {
            session_id: Some("roaming".to_string()),
            project_path: None,
            offset: 0,
            limit: 10,
        })
        .await
        .expect("load by id");
    assert_eq!(loaded.count, 1);
}

#[tokio::test]
async fn missing_session_is_a_typed_error() {
    let fixture = fixture();
    let err = fixture
        .resolver
        .load(&load_params("ghost", &fixture.project, 0, 10))
        .await
        .expect_err("missing session");
    assert_matches!(err, GatewayErr::HistoryFileNotFound(_));

    let err = fixture
        .resolver
        .load(&LoadHistoryParams {
            session_id: None,
            project_path: None,
            offset: 0,
            limit: 10,
        })
        .await
        .expect_err("no selector");
    assert_matches!(err, GatewayErr::BadOptions(_));
}

#[tokio::test]
async fn discovery_lists_newest_first_with_previews() {
    let fixture = fixture();
    let long_message = "x".repeat(400);
    write_session(
        &fixture.resolver,
        &fixture.project,
        "older",
        &[
            user_record("u1", "2026-07-01T10:00:00Z", &long_message),
            assistant_record("u2", "2026-07-01T10:00:05Z", "sure"),
        ],
    );
    // Ensure distinct mtimes even on coarse filesystems.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    write_session(
        &fixture.resolver,
        &fixture.project,
        "newer",
        &[
            r#"{"type":"summary","summary":"My renamed session","uuid":"t0"}"#.to_string(),
            user_record("u3", "2026-07-02T10:00:00Z", "hello there"),
        ],
    );

    let listed = fixture
        .resolver
        .list_sessions(&fixture.project, 10, 0)
        .await
        .expect("list");
    assert_eq!(listed.total, 2);
    assert_eq!(listed.sessions[0].session_id, "newer");
    assert_eq!(
        listed.sessions[0].custom_title.as_deref(),
        Some("My renamed session")
    );
    assert_eq!(
        listed.sessions[0].first_user_message.as_deref(),
        Some("hello there")
    );
    assert_eq!(listed.sessions[1].session_id, "older");
    assert_eq!(
        listed.sessions[1]
            .first_user_message
            .as_ref()
            .map(String::len),
        Some(200)
    );
    assert_eq!(listed.sessions[1].message_count, 2);

    // Paging applies after ordering.
    let second_page = fixture
        .resolver
        .list_sessions(&fixture.project, 1, 1)
        .await
        .expect("page");
    assert_eq!(second_page.total, 2);
    assert_eq!(second_page.sessions.len(), 1);
    assert_eq!(second_page.sessions[0].session_id, "older");
}

#[tokio::test]
async fn discovery_of_unknown_project_is_empty() {
    let fixture = fixture();
    let listed = fixture
        .resolver
        .list_sessions(Path::new("/nowhere/at/all"), 10, 0)
        .await
        .expect("list");
    assert_eq!(listed.total, 0);
    assert!(listed.sessions.is_empty());
}

#[tokio::test]
async fn metadata_reports_lines_and_title() {
    let fixture = fixture();
    write_session(
        &fixture.resolver,
        &fixture.project,
        "s1",
        &[
            r#"{"type":"summary","summary":"titled","uuid":"t0"}"#.to_string(),
            user_record("u1", "2026-07-01T10:00:00Z", "hi"),
            assistant_record("u2", "2026-07-01T10:00:01Z", "hello"),
        ],
    );

    let metadata = fixture
        .resolver
        .metadata("s1", &fixture.project)
        .await
        .expect("metadata");
    assert_eq!(metadata.total_lines, 3);
    assert_eq!(metadata.custom_title.as_deref(), Some("titled"));
    assert_eq!(metadata.session_id, "s1");
}

#[tokio::test]
async fn truncate_removes_the_uuid_and_everything_after() {
    let fixture = fixture();
    write_session(
        &fixture.resolver,
        &fixture.project,
        "s1",
        &[
            user_record("u1", "2026-07-01T10:00:00Z", "keep"),
            assistant_record("u2", "2026-07-01T10:00:01Z", "keep too"),
            user_record("u3", "2026-07-01T10:00:02Z", "cut from here"),
            assistant_record("u4", "2026-07-01T10:00:03Z", "gone"),
        ],
    );

    let result = fixture
        .resolver
        .truncate("s1", &fixture.project, "u3")
        .await
        .expect("truncate");
    assert!(result.success);
    assert_eq!(result.remaining_lines, 2);

    let content = std::fs::read_to_string(session_file(
        fixture.resolver.claude_home(),
        &fixture.project,
        "s1",
    ))
    .expect("read back");
    assert_eq!(content.lines().count(), 2);
    assert!(content.contains("u2"));
    assert!(!content.contains("u3"));

    // The resolver serves the truncated view immediately.
    let loaded = fixture
        .resolver
        .load(&load_params("s1", &fixture.project, 0, 10))
        .await
        .expect("reload");
    assert_eq!(loaded.available_count, 2);
}

#[tokio::test]
async fn truncate_with_unknown_uuid_fails_and_leaves_the_file_alone() {
    let fixture = fixture();
    let lines = [user_record("u1", "2026-07-01T10:00:00Z", "only")];
    write_session(&fixture.resolver, &fixture.project, "s1", &lines);

    let err = fixture
        .resolver
        .truncate("s1", &fixture.project, "missing")
        .await
        .expect_err("unknown uuid");
    assert_matches!(err, GatewayErr::HistoryUuidNotFound(_));

    let content = std::fs::read_to_string(session_file(
        fixture.resolver.claude_home(),
        &fixture.project,
        "s1",
    ))
    .expect("read back");
    assert_eq!(content.lines().count(), 1);
}

#[test]
fn encoding_matches_the_cli_layout() {
    assert_eq!(
        encode_project_path("/home/erio/codes/claude-code-plus"),
        "-home-erio-codes-claude-code-plus"
    );
    assert_eq!(
        encode_project_path(r"C:\Users\u\.my_proj"),
        "C--Users-u--my-proj"
    );
}
