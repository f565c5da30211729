#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use gateway_core::GatewayErr;
use gateway_core::Orchestrator;
use gateway_core::Subscriber;
use gateway_core::session::SUBSCRIBER_QUEUE_CAPACITY;
use gateway_protocol::event::StatusSystemEvent;
use gateway_protocol::event::StreamEventMsg;
use gateway_protocol::rpc::ConnectParams;
use gateway_protocol::rpc::ConnectResponse;
use gateway_protocol::rpc::PermissionScope;
use gateway_protocol::rpc::PermissionUpdate;
use gateway_protocol::rpc::QueryParams;
use gateway_protocol::rpc::RequestPermissionResponse;
use gateway_protocol::rpc::ResponseEnvelope;
use gateway_protocol::rpc::ServerRequest;
use gateway_protocol::rpc::SessionRefParams;
use gateway_protocol::rpc::SetModelParams;
use gateway_protocol::rpc::StreamCompletionCode;
use gateway_protocol::rpc::StreamFrame;
use uuid::Uuid;

use super::common::FakeChannel;
use super::common::collect_stream;
use super::common::fake_cli;
use super::common::test_config;

struct Fixture {
    orchestrator: Arc<Orchestrator>,
    channel: Arc<FakeChannel>,
    project: PathBuf,
    _tmp: tempfile::TempDir,
}

fn fixture(cli_body: &str) -> Fixture {
    let tmp = tempfile::tempdir().expect("tempdir");
    let project = tmp.path().join("proj");
    std::fs::create_dir_all(&project).expect("mkdir project");
    let cli = fake_cli(tmp.path(), cli_body);
    let orchestrator = Arc::new(Orchestrator::new(test_config(
        cli,
        tmp.path().join("claude-home"),
    )));
    Fixture {
        orchestrator,
        channel: Arc::new(FakeChannel::default()),
        project,
        _tmp: tmp,
    }
}

async fn connect(fixture: &Fixture) -> ConnectResponse {
    fixture
        .orchestrator
        .connect(
            Uuid::new_v4(),
            fixture.channel.clone(),
            ConnectParams {
                provider: Some("claude".to_string()),
                cwd: fixture.project.clone(),
                model: None,
                permission_mode: None,
                skip_permissions: false,
                max_thinking_tokens: None,
                system_prompt: None,
                sandbox_mode: None,
                include_partial_messages: false,
                resume_session_id: None,
            },
        )
        .await
        .expect("connect")
}

fn subscriber() -> (Subscriber, mpsc::Receiver<StreamFrame>) {
    let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
    (Subscriber { call_id: 1, tx }, rx)
}

const SINGLE_TURN_CLI: &str = r#"
echo '{"type":"system","subtype":"init","session_id":"abc-123","model":"claude-sonnet-4-5","tools":["Bash"]}'
echo '{"type":"assistant","uuid":"u1","message":{"content":[{"type":"text","text":"hi"}]}}'
echo '{"type":"result","subtype":"ok","num_turns":1}'
"#;

#[tokio::test]
async fn fresh_session_single_turn() {
    let fixture = fixture(SINGLE_TURN_CLI);
    let response = connect(&fixture).await;
    assert_eq!(response.session_id, None);
    assert!(response.capabilities.can_interrupt);
    assert_eq!(response.model, "claude-sonnet-4-5");

    let (sub, rx) = subscriber();
    fixture
        .orchestrator
        .query(
            QueryParams {
                gateway_session_id: response.gateway_session_id,
                message: "hello".to_string(),
            },
            sub,
        )
        .await
        .expect("query");

    let frames = collect_stream(rx).await;
    let msgs: Vec<&StreamEventMsg> = frames
        .iter()
        .filter_map(|f| match f {
            StreamFrame::Item { event } => Some(&event.msg),
            _ => None,
        })
        .collect();

    assert_matches!(msgs[0], StreamEventMsg::SystemInit(init) if init.session_id == "abc-123");
    assert_matches!(
        msgs[1],
        StreamEventMsg::StatusSystem(s) if s.status == StatusSystemEvent::SESSION_BOUND
    );
    assert_matches!(msgs[2], StreamEventMsg::AssistantText(t) if t.text == "hi");
    assert_matches!(
        msgs[3],
        StreamEventMsg::TurnResult(r) if r.subtype == "ok" && r.num_turns == Some(1)
    );
    assert_matches!(
        frames.last(),
        Some(StreamFrame::Completed {
            code: StreamCompletionCode::Done
        })
    );

    // Timestamps never go backwards for a subscriber.
    let mut last = 0;
    for frame in &frames {
        if let StreamFrame::Item { event } = frame {
            assert!(event.received_at_ms >= last);
            last = event.received_at_ms;
        }
    }

    // The turn settled back to idle and the binding stuck.
    let sessions = fixture
        .orchestrator
        .list_sessions()
        .await
        .expect("list")
        .sessions;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].state, "idle");
    assert_eq!(sessions[0].session_id.as_deref(), Some("abc-123"));
    assert_eq!(sessions[0].turn_counter, 1);
}

#[tokio::test]
async fn query_while_streaming_fails_fast() {
    let fixture = fixture(
        r#"
echo '{"type":"system","subtype":"init","session_id":"abc-123"}'
sleep 5
echo '{"type":"result","subtype":"ok"}'
"#,
    );
    let response = connect(&fixture).await;

    let (sub, rx) = subscriber();
    fixture
        .orchestrator
        .query(
            QueryParams {
                gateway_session_id: response.gateway_session_id,
                message: "first".to_string(),
            },
            sub,
        )
        .await
        .expect("first query");

    // Wait for the stream to be live before racing it.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (second, _rx2) = subscriber();
    let err = fixture
        .orchestrator
        .query(
            QueryParams {
                gateway_session_id: response.gateway_session_id,
                message: "second".to_string(),
            },
            second,
        )
        .await
        .expect_err("second query while streaming");
    assert_matches!(err, GatewayErr::WrongState { expected: "idle", .. });

    // Only the first turn counted.
    let sessions = fixture
        .orchestrator
        .list_sessions()
        .await
        .expect("list")
        .sessions;
    assert_eq!(sessions[0].turn_counter, 1);

    fixture
        .orchestrator
        .disconnect(SessionRefParams {
            gateway_session_id: response.gateway_session_id,
        })
        .await
        .expect("disconnect");
    drop(rx);
}

#[tokio::test]
async fn interrupt_mid_stream_keeps_the_stream_open_until_eof() {
    let fixture = fixture(
        r#"
trap 'echo "{\"type\":\"user\",\"uuid\":\"u9\",\"message\":{\"content\":\"[Request interrupted by user]\"}}"; echo "{\"type\":\"result\",\"subtype\":\"interrupted\"}"; exit 0' TERM
echo '{"type":"system","subtype":"init","session_id":"abc-123"}'
echo '{"type":"assistant","uuid":"u1","message":{"content":[{"type":"text","text":"working"}]}}'
sleep 10 &
wait $!
"#,
    );
    let response = connect(&fixture).await;

    let (sub, rx) = subscriber();
    fixture
        .orchestrator
        .query(
            QueryParams {
                gateway_session_id: response.gateway_session_id,
                message: "go".to_string(),
            },
            sub,
        )
        .await
        .expect("query");

    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    let status = fixture
        .orchestrator
        .interrupt(SessionRefParams {
            gateway_session_id: response.gateway_session_id,
        })
        .await
        .expect("interrupt");
    assert_eq!(status.status, "interrupting");
    assert!(started.elapsed() < Duration::from_millis(500));

    // Interrupt is idempotent while already interrupting.
    let again = fixture
        .orchestrator
        .interrupt(SessionRefParams {
            gateway_session_id: response.gateway_session_id,
        })
        .await
        .expect("second interrupt");
    assert_eq!(again.status, "interrupting");

    let frames = collect_stream(rx).await;
    let has_interrupt_result = frames.iter().any(|f| {
        matches!(
            f,
            StreamFrame::Item { event }
                if matches!(&event.msg, StreamEventMsg::TurnResult(r) if r.subtype == "interrupted")
        )
    });
    let has_tool_result = frames.iter().any(|f| {
        matches!(
            f,
            StreamFrame::Item { event }
                if matches!(&event.msg, StreamEventMsg::UserToolResult(r)
                    if r.content.contains("interrupted by user"))
        )
    });
    assert!(has_tool_result, "missing interrupted tool result: {frames:?}");
    assert!(has_interrupt_result, "missing interrupted result: {frames:?}");
    assert_matches!(frames.last(), Some(StreamFrame::Completed { .. }));

    let sessions = fixture
        .orchestrator
        .list_sessions()
        .await
        .expect("list")
        .sessions;
    assert_eq!(sessions[0].state, "idle");
}

#[tokio::test]
async fn interrupt_while_idle_is_wrong_state() {
    let fixture = fixture(SINGLE_TURN_CLI);
    let response = connect(&fixture).await;
    let err = fixture
        .orchestrator
        .interrupt(SessionRefParams {
            gateway_session_id: response.gateway_session_id,
        })
        .await
        .expect_err("interrupt while idle");
    assert_matches!(
        err,
        GatewayErr::WrongState {
            expected: "streaming",
            ..
        }
    );
}

#[tokio::test]
async fn disconnect_is_idempotent_and_removes_the_session() {
    let fixture = fixture(SINGLE_TURN_CLI);
    let response = connect(&fixture).await;

    for _ in 0..2 {
        fixture
            .orchestrator
            .disconnect(SessionRefParams {
                gateway_session_id: response.gateway_session_id,
            })
            .await
            .expect("disconnect");
    }
    assert!(
        fixture
            .orchestrator
            .list_sessions()
            .await
            .expect("list")
            .sessions
            .is_empty()
    );

    // Closing once pushes one close command; the idempotent retry is silent.
    let notifications = fixture.channel.notifications.lock().expect("lock");
    assert_eq!(notifications.len(), 1);
    assert_matches!(
        &notifications[0],
        gateway_protocol::rpc::ServerNotification::SessionCommand { params }
            if params.command == gateway_protocol::rpc::SessionCommandKind::Close
                && params.gateway_session_id == Some(response.gateway_session_id)
    );
}

#[tokio::test]
async fn client_disconnect_closes_owned_sessions() {
    let fixture = fixture(SINGLE_TURN_CLI);
    let client_id = Uuid::new_v4();
    fixture
        .orchestrator
        .connect(
            client_id,
            fixture.channel.clone(),
            ConnectParams {
                provider: None,
                cwd: fixture.project.clone(),
                model: None,
                permission_mode: None,
                skip_permissions: false,
                max_thinking_tokens: None,
                system_prompt: None,
                sandbox_mode: None,
                include_partial_messages: false,
                resume_session_id: None,
            },
        )
        .await
        .expect("connect");

    fixture.orchestrator.on_client_disconnect(client_id).await;
    assert!(
        fixture
            .orchestrator
            .list_sessions()
            .await
            .expect("list")
            .sessions
            .is_empty()
    );
}

#[tokio::test]
async fn connect_rejects_bad_options() {
    let fixture = fixture(SINGLE_TURN_CLI);

    let mut params = ConnectParams {
        provider: Some("copilot".to_string()),
        cwd: fixture.project.clone(),
        model: None,
        permission_mode: None,
        skip_permissions: false,
        max_thinking_tokens: None,
        system_prompt: None,
        sandbox_mode: None,
        include_partial_messages: false,
        resume_session_id: None,
    };
    let err = fixture
        .orchestrator
        .connect(Uuid::new_v4(), fixture.channel.clone(), params.clone())
        .await
        .expect_err("provider");
    assert_matches!(err, GatewayErr::BadOptions(_));

    params.provider = None;
    params.cwd = PathBuf::from("relative/path");
    let err = fixture
        .orchestrator
        .connect(Uuid::new_v4(), fixture.channel.clone(), params.clone())
        .await
        .expect_err("cwd");
    assert_matches!(err, GatewayErr::BadOptions(_));

    params.cwd = fixture.project.clone();
    params.model = Some("gpt-4o".to_string());
    let err = fixture
        .orchestrator
        .connect(Uuid::new_v4(), fixture.channel.clone(), params)
        .await
        .expect_err("model");
    assert_matches!(err, GatewayErr::BadOptions(message) if message.contains("gpt-4o"));
}

#[tokio::test]
async fn connect_fails_without_cli_and_creates_no_session() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let project = tmp.path().join("proj");
    std::fs::create_dir_all(&project).expect("mkdir");
    let orchestrator = Arc::new(Orchestrator::new(test_config(
        tmp.path().join("missing-claude"),
        tmp.path().join("claude-home"),
    )));

    let err = orchestrator
        .connect(
            Uuid::new_v4(),
            Arc::new(FakeChannel::default()),
            ConnectParams {
                provider: None,
                cwd: project,
                model: None,
                permission_mode: None,
                skip_permissions: false,
                max_thinking_tokens: None,
                system_prompt: None,
                sandbox_mode: None,
                include_partial_messages: false,
                resume_session_id: None,
            },
        )
        .await
        .expect_err("missing cli");
    assert_matches!(err, GatewayErr::CliNotFound(_));
    assert!(orchestrator.list_sessions().await.expect("list").sessions.is_empty());
}

#[tokio::test]
async fn set_model_validates_and_applies_next_turn() {
    let fixture = fixture(SINGLE_TURN_CLI);
    let response = connect(&fixture).await;

    let err = fixture
        .orchestrator
        .set_model(SetModelParams {
            gateway_session_id: response.gateway_session_id,
            model: "made-up".to_string(),
        })
        .await
        .expect_err("unknown model");
    assert_matches!(err, GatewayErr::BadOptions(_));

    let ok = fixture
        .orchestrator
        .set_model(SetModelParams {
            gateway_session_id: response.gateway_session_id,
            model: "opus".to_string(),
        })
        .await
        .expect("alias");
    assert_eq!(ok.model, "claude-opus-4-1");
}

#[tokio::test]
async fn denied_permission_produces_denied_tool_result() {
    let fixture = fixture(
        r#"
echo '{"type":"system","subtype":"init","session_id":"abc-123"}'
echo '{"type":"status_system","status":"permission_request","tool_name":"Bash","input":{"command":"rm -rf /"},"tool_use_id":"t1"}'
echo '{"type":"result","subtype":"ok"}'
"#,
    );
    fixture.channel.respond_with(
        fixture.orchestrator.clone(),
        |request| match request {
            ServerRequest::RequestPermission { .. } => ResponseEnvelope::ok(
                &RequestPermissionResponse {
                    approved: false,
                    deny_reason: Some("nope".to_string()),
                    updated_input: None,
                    permission_updates: Vec::new(),
                },
            )
            .expect("envelope"),
            other => panic!("unexpected reverse call {other:?}"),
        },
    );
    let response = connect(&fixture).await;

    let (sub, rx) = subscriber();
    fixture
        .orchestrator
        .query(
            QueryParams {
                gateway_session_id: response.gateway_session_id,
                message: "run it".to_string(),
            },
            sub,
        )
        .await
        .expect("query");
    let frames = collect_stream(rx).await;

    let calls = fixture.channel.recorded_calls();
    assert_eq!(calls.len(), 1);
    assert_matches!(
        &calls[0].1,
        ServerRequest::RequestPermission { params }
            if params.tool_name == "Bash" && params.input["command"] == "rm -rf /"
    );

    let denial = frames.iter().find_map(|f| match f {
        StreamFrame::Item { event } => match &event.msg {
            StreamEventMsg::UserToolResult(r) if r.is_error => Some(r.clone()),
            _ => None,
        },
        _ => None,
    });
    let denial = denial.expect("denied tool result in stream");
    assert!(denial.content.contains("nope"));
    assert_eq!(denial.tool_use_id.as_deref(), Some("t1"));

    // Session scope only: nothing was persisted to settings files.
    assert!(!fixture.project.join(".claude/settings.json").exists());
}

#[tokio::test]
async fn permission_updates_persist_at_requested_scope() {
    let fixture = fixture(
        r#"
echo '{"type":"system","subtype":"init","session_id":"abc-123"}'
echo '{"type":"status_system","status":"permission_request","tool_name":"Bash","input":{"command":"ls"},"tool_use_id":"t1"}'
echo '{"type":"result","subtype":"ok"}'
"#,
    );
    fixture.channel.respond_with(fixture.orchestrator.clone(), |_| {
        ResponseEnvelope::ok(&RequestPermissionResponse {
            approved: true,
            deny_reason: None,
            updated_input: None,
            permission_updates: vec![PermissionUpdate {
                scope: PermissionScope::ProjectSettings,
                allow: vec!["Bash(ls:*)".to_string()],
                deny: Vec::new(),
            }],
        })
        .expect("envelope")
    });
    let response = connect(&fixture).await;

    let (sub, rx) = subscriber();
    fixture
        .orchestrator
        .query(
            QueryParams {
                gateway_session_id: response.gateway_session_id,
                message: "list".to_string(),
            },
            sub,
        )
        .await
        .expect("query");
    collect_stream(rx).await;

    let settings = std::fs::read_to_string(fixture.project.join(".claude/settings.json"))
        .expect("settings written");
    assert!(settings.contains("Bash(ls:*)"), "{settings}");
}

#[tokio::test]
async fn ask_user_question_round_trip() {
    let fixture = fixture(
        r#"
echo '{"type":"system","subtype":"init","session_id":"abc-123"}'
echo '{"type":"assistant","uuid":"u1","message":{"content":[{"type":"tool_use","id":"q1","name":"AskUserQuestion","input":{"questions":[{"question":"Proceed?","options":[{"label":"yes"},{"label":"no"}],"multiSelect":false}]}}]}}'
echo '{"type":"result","subtype":"ok"}'
"#,
    );
    fixture.channel.respond_with(fixture.orchestrator.clone(), |_| {
        ResponseEnvelope {
            success: true,
            result: Some(serde_json::json!({
                "answers": [{"questionIndex": 0, "selected": ["yes"]}]
            })),
            error: None,
        }
    });
    let response = connect(&fixture).await;

    let (sub, rx) = subscriber();
    fixture
        .orchestrator
        .query(
            QueryParams {
                gateway_session_id: response.gateway_session_id,
                message: "ask me".to_string(),
            },
            sub,
        )
        .await
        .expect("query");
    let frames = collect_stream(rx).await;

    let answered = frames.iter().any(|f| {
        matches!(
            f,
            StreamFrame::Item { event }
                if matches!(&event.msg, StreamEventMsg::StatusSystem(s)
                    if s.status == StatusSystemEvent::QUESTION_ANSWERED)
        )
    });
    assert!(answered, "no question_answered status in {frames:?}");
    assert_eq!(fixture.channel.recorded_calls().len(), 1);
}

#[tokio::test]
async fn run_in_background_detaches_the_subscriber() {
    let fixture = fixture(
        r#"
echo '{"type":"system","subtype":"init","session_id":"abc-123"}'
sleep 3
echo '{"type":"result","subtype":"ok"}'
"#,
    );
    let response = connect(&fixture).await;

    let (sub, rx) = subscriber();
    fixture
        .orchestrator
        .query(
            QueryParams {
                gateway_session_id: response.gateway_session_id,
                message: "work".to_string(),
            },
            sub,
        )
        .await
        .expect("query");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = fixture
        .orchestrator
        .run_in_background(SessionRefParams {
            gateway_session_id: response.gateway_session_id,
        })
        .await
        .expect("detach");
    assert_eq!(status.status, "detached");

    let frames = collect_stream(rx).await;
    assert_matches!(
        frames.last(),
        Some(StreamFrame::Completed {
            code: StreamCompletionCode::Detached
        })
    );

    // The child keeps running: the session is still streaming.
    let sessions = fixture
        .orchestrator
        .list_sessions()
        .await
        .expect("list")
        .sessions;
    assert_eq!(sessions[0].state, "streaming");

    fixture
        .orchestrator
        .disconnect(SessionRefParams {
            gateway_session_id: response.gateway_session_id,
        })
        .await
        .expect("disconnect");
}

#[tokio::test]
async fn child_crash_emits_final_error_then_idle() {
    let fixture = fixture(
        r#"
echo '{"type":"system","subtype":"init","session_id":"abc-123"}'
echo 'fatal: model backend unreachable' >&2
exit 3
"#,
    );
    let response = connect(&fixture).await;

    let (sub, rx) = subscriber();
    fixture
        .orchestrator
        .query(
            QueryParams {
                gateway_session_id: response.gateway_session_id,
                message: "boom".to_string(),
            },
            sub,
        )
        .await
        .expect("query");
    let frames = collect_stream(rx).await;

    let error_event = frames.iter().any(|f| {
        matches!(
            f,
            StreamFrame::Item { event } if matches!(&event.msg, StreamEventMsg::Error(_))
        )
    });
    assert!(error_event, "no error event in {frames:?}");
    assert_matches!(frames.last(), Some(StreamFrame::Completed { .. }));

    let sessions = fixture
        .orchestrator
        .list_sessions()
        .await
        .expect("list")
        .sessions;
    assert_eq!(sessions[0].state, "idle");
}

#[tokio::test]
async fn dropped_subscriber_does_not_kill_the_turn() {
    let fixture = fixture(
        r#"
echo '{"type":"system","subtype":"init","session_id":"abc-123"}'
sleep 1
echo '{"type":"assistant","uuid":"u1","message":{"content":[{"type":"text","text":"late"}]}}'
echo '{"type":"result","subtype":"ok","num_turns":1}'
"#,
    );
    let response = connect(&fixture).await;

    let (sub, rx) = subscriber();
    fixture
        .orchestrator
        .query(
            QueryParams {
                gateway_session_id: response.gateway_session_id,
                message: "go".to_string(),
            },
            sub,
        )
        .await
        .expect("query");

    // The client goes away mid-stream without interrupting.
    drop(rx);

    // The turn still runs to completion and its events land in the log.
    let mut state = String::new();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        state = fixture.orchestrator.list_sessions().await.expect("list").sessions[0]
            .state
            .clone();
        if state == "idle" {
            break;
        }
    }
    assert_eq!(state, "idle");

    let history = fixture
        .orchestrator
        .get_history(SessionRefParams {
            gateway_session_id: response.gateway_session_id,
        })
        .await
        .expect("history");
    let saw_result = history.events.iter().any(|event| {
        matches!(&event.msg, StreamEventMsg::TurnResult(r) if r.subtype == "ok")
    });
    assert!(saw_result, "turn must finish after subscriber drop");
}

#[tokio::test]
async fn query_with_content_renders_blocks_into_one_turn() {
    let fixture = fixture(
        r#"
echo "$@" > argv.txt
echo '{"type":"system","subtype":"init","session_id":"abc-123"}'
echo '{"type":"result","subtype":"ok"}'
"#,
    );
    let response = connect(&fixture).await;

    let (sub, rx) = subscriber();
    fixture
        .orchestrator
        .query_with_content(
            gateway_protocol::rpc::QueryWithContentParams {
                gateway_session_id: response.gateway_session_id,
                blocks: vec![
                    gateway_protocol::rpc::ContentBlock::Text {
                        text: "part one".to_string(),
                    },
                    gateway_protocol::rpc::ContentBlock::Text {
                        text: "part two".to_string(),
                    },
                ],
            },
            sub,
        )
        .await
        .expect("query with content");
    collect_stream(rx).await;

    let argv = std::fs::read_to_string(fixture.project.join("argv.txt")).expect("argv captured");
    assert!(argv.contains("part one"), "{argv}");
    assert!(argv.contains("part two"), "{argv}");

    // Image blocks are rejected before any child is spawned.
    let (sub, _rx) = subscriber();
    let err = fixture
        .orchestrator
        .query_with_content(
            gateway_protocol::rpc::QueryWithContentParams {
                gateway_session_id: response.gateway_session_id,
                blocks: vec![gateway_protocol::rpc::ContentBlock::Image {
                    media_type: "image/png".to_string(),
                    data: "aGk=".to_string(),
                }],
            },
            sub,
        )
        .await
        .expect_err("image block");
    assert_matches!(err, GatewayErr::UnsupportedCapability("canSendRichContent"));
}

#[tokio::test]
async fn resume_prepends_history_and_passes_resume_flag() {
    let fixture = fixture(
        r#"
echo "$@" > argv.txt
echo '{"type":"system","subtype":"init","session_id":"abc-123"}'
echo '{"type":"result","subtype":"ok"}'
"#,
    );

    // Seed an on-disk session the CLI would have produced earlier.
    let encoded = gateway_core::history::encode_project_path(&fixture.project.to_string_lossy());
    let claude_home = fixture.orchestrator.config().claude_home.clone();
    let dir = claude_home.join("projects").join(encoded);
    std::fs::create_dir_all(&dir).expect("mkdir history");
    std::fs::write(
        dir.join("abc-123.jsonl"),
        concat!(
            r#"{"type":"user","uuid":"h1","sessionId":"abc-123","timestamp":"2026-07-01T10:00:00Z","message":{"content":"earlier question"}}"#,
            "\n",
            r#"{"type":"assistant","uuid":"h2","sessionId":"abc-123","timestamp":"2026-07-01T10:00:05Z","message":{"content":[{"type":"text","text":"earlier answer"}]}}"#,
            "\n",
        ),
    )
    .expect("seed history");

    let response = fixture
        .orchestrator
        .connect(
            Uuid::new_v4(),
            fixture.channel.clone(),
            ConnectParams {
                provider: None,
                cwd: fixture.project.clone(),
                model: None,
                permission_mode: None,
                skip_permissions: false,
                max_thinking_tokens: None,
                system_prompt: None,
                sandbox_mode: None,
                include_partial_messages: false,
                resume_session_id: Some("abc-123".to_string()),
            },
        )
        .await
        .expect("connect with resume");
    assert_eq!(response.session_id.as_deref(), Some("abc-123"));

    // The resumed prefix is visible through getHistory before any turn.
    let history = fixture
        .orchestrator
        .get_history(SessionRefParams {
            gateway_session_id: response.gateway_session_id,
        })
        .await
        .expect("get history");
    assert_eq!(history.events.len(), 2);

    let (sub, rx) = subscriber();
    fixture
        .orchestrator
        .query(
            QueryParams {
                gateway_session_id: response.gateway_session_id,
                message: "continue".to_string(),
            },
            sub,
        )
        .await
        .expect("query");
    collect_stream(rx).await;

    let argv = std::fs::read_to_string(fixture.project.join("argv.txt")).expect("argv captured");
    assert!(argv.contains("--resume abc-123"), "{argv}");
    assert!(argv.contains("--output-format stream-json"), "{argv}");
}
