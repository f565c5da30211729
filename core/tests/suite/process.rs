#![cfg(unix)]

use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use pretty_assertions::assert_eq;
use tokio::process::Child;
use tokio::process::Command;
use uuid::Uuid;

use gateway_core::process::ChildLine;
use gateway_core::process::ChildState;
use gateway_core::process::OutputStream;
use gateway_core::process::Supervisor;

fn sh(script: &str) -> Child {
    Command::new("/bin/sh")
        .arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Mirror spawn_agent_child's setsid(): signal_group targets -(pid),
        // which only reaches the child if it leads its own process group.
        .process_group(0)
        .spawn()
        .expect("spawn sh")
}

fn supervisor() -> Supervisor {
    Supervisor::new(Duration::from_millis(200))
}

#[tokio::test]
async fn lines_arrive_in_order_until_eof() {
    let supervisor = supervisor();
    let mut child = supervisor
        .supervise(sh("echo one; echo two; echo three"), Uuid::new_v4())
        .expect("supervise");

    let mut stdout_lines = Vec::new();
    while let Some(ChildLine { stream, line }) = child.next_line().await {
        assert_eq!(stream, OutputStream::Stdout);
        stdout_lines.push(line);
    }
    assert_eq!(stdout_lines, vec!["one", "two", "three"]);

    let status = child.wait().await.expect("wait");
    assert!(status.success());
    assert_eq!(child.state(), ChildState::Exited);
}

#[tokio::test]
async fn stderr_lines_are_tagged() {
    let supervisor = supervisor();
    let mut child = supervisor
        .supervise(sh("echo out; echo err >&2"), Uuid::new_v4())
        .expect("supervise");

    let mut seen = Vec::new();
    while let Some(line) = child.next_line().await {
        seen.push(line);
    }
    assert!(seen.contains(&ChildLine {
        stream: OutputStream::Stdout,
        line: "out".to_string(),
    }));
    assert!(seen.contains(&ChildLine {
        stream: OutputStream::Stderr,
        line: "err".to_string(),
    }));
    child.wait().await.expect("wait");
}

#[tokio::test]
async fn partial_line_at_eof_is_discarded() {
    let supervisor = supervisor();
    let mut child = supervisor
        .supervise(sh("printf 'whole\\npartial'"), Uuid::new_v4())
        .expect("supervise");

    let mut lines = Vec::new();
    while let Some(ChildLine { line, .. }) = child.next_line().await {
        lines.push(line);
    }
    assert_eq!(lines, vec!["whole"]);
    child.wait().await.expect("wait");
}

#[tokio::test]
async fn graceful_terminate_lets_the_child_flush() {
    let supervisor = supervisor();
    let mut child = supervisor
        .supervise(
            sh("trap 'echo flushed; exit 0' TERM; echo ready; sleep 30 & wait $!"),
            Uuid::new_v4(),
        )
        .expect("supervise");

    // Wait for the child to be responsive before signalling.
    let first = child.next_line().await.expect("ready line");
    assert_eq!(first.line, "ready");

    child.request_terminate(false).await;

    let mut rest = Vec::new();
    while let Some(ChildLine { line, .. }) = child.next_line().await {
        rest.push(line);
    }
    assert_eq!(rest, vec!["flushed"]);
    let status = child.wait().await.expect("wait");
    assert!(status.success());
}

#[tokio::test]
async fn stubborn_child_is_killed_after_the_grace_period() {
    let supervisor = supervisor();
    let mut child = supervisor
        .supervise(
            // TERM is ignored and the sleep respawns, so only KILL ends it.
            sh("trap '' TERM; echo ready; while :; do sleep 1; done"),
            Uuid::new_v4(),
        )
        .expect("supervise");

    let first = child.next_line().await.expect("ready line");
    assert_eq!(first.line, "ready");

    let started = Instant::now();
    child.request_terminate(false).await;
    while child.next_line().await.is_some() {}
    let status = child.wait().await.expect("wait");
    assert!(!status.success(), "killed child must not exit cleanly");
    // TERM was ignored; the KILL follows the grace period promptly.
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn forceful_terminate_kills_immediately() {
    let supervisor = supervisor();
    let mut child = supervisor
        .supervise(sh("echo ready; sleep 30 & wait $!"), Uuid::new_v4())
        .expect("supervise");

    let first = child.next_line().await.expect("ready line");
    assert_eq!(first.line, "ready");

    child.request_terminate(true).await;
    while child.next_line().await.is_some() {}
    let status = child.wait().await.expect("wait");
    assert!(!status.success());
}

#[tokio::test]
async fn process_table_tracks_the_child_lifetime() {
    let supervisor = supervisor();
    let session = Uuid::new_v4();
    let mut child = supervisor
        .supervise(sh("echo hi"), session)
        .expect("supervise");
    let pid = child.pid().expect("pid");
    assert_eq!(supervisor.process_table().session_for(pid), Some(session));

    while child.next_line().await.is_some() {}
    child.wait().await.expect("wait");
    assert_eq!(supervisor.process_table().session_for(pid), None);
    assert!(supervisor.process_table().is_empty());
}
