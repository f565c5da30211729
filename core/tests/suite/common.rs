//! Shared fixtures: a scripted fake agent CLI, a recording client channel,
//! and stream-collection helpers.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use gateway_core::Config;
use gateway_core::Orchestrator;
use gateway_core::Result;
use gateway_core::config::DEFAULT_KEEP_ALIVE_INTERVAL;
use gateway_core::config::DEFAULT_KEEP_ALIVE_TIMEOUT;
use gateway_core::reverse::ClientChannel;
use gateway_protocol::rpc::CallId;
use gateway_protocol::rpc::ResponseEnvelope;
use gateway_protocol::rpc::ServerNotification;
use gateway_protocol::rpc::ServerRequest;
use gateway_protocol::rpc::StreamFrame;

/// Write an executable `/bin/sh` script that stands in for the agent CLI.
/// The script receives the real flag set and is free to ignore it.
#[cfg(unix)]
pub fn fake_cli(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-claude");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write fake cli");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod fake cli");
    path
}

pub fn test_config(claude_bin: PathBuf, claude_home: PathBuf) -> Config {
    Config {
        claude_bin,
        grace_period: Duration::from_millis(200),
        keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
        keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
        reverse_call_timeout: Duration::from_secs(5),
        extra_models: Vec::new(),
        claude_home,
        gateway_home: std::env::temp_dir().join("agent-gateway-tests"),
    }
}

type Responder = Box<dyn Fn(&ServerRequest) -> ResponseEnvelope + Send + Sync>;

/// Client channel that records reverse calls and, when configured, answers
/// them through the orchestrator's reply path like a real client would.
#[derive(Default)]
pub struct FakeChannel {
    pub calls: StdMutex<Vec<(CallId, ServerRequest)>>,
    pub notifications: StdMutex<Vec<ServerNotification>>,
    responder: OnceLock<Responder>,
    orchestrator: OnceLock<Arc<Orchestrator>>,
}

impl FakeChannel {
    pub fn respond_with(
        &self,
        orchestrator: Arc<Orchestrator>,
        responder: impl Fn(&ServerRequest) -> ResponseEnvelope + Send + Sync + 'static,
    ) {
        let _ = self.orchestrator.set(orchestrator);
        let _ = self.responder.set(Box::new(responder));
    }

    pub fn recorded_calls(&self) -> Vec<(CallId, ServerRequest)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl ClientChannel for FakeChannel {
    async fn send_reverse_call(&self, call_id: CallId, request: ServerRequest) -> Result<()> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((call_id, request.clone()));
        if let (Some(responder), Some(orchestrator)) =
            (self.responder.get(), self.orchestrator.get())
        {
            let reply = responder(&request);
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator.complete_reverse_call(call_id, reply).await;
            });
        }
        Ok(())
    }

    async fn send_notification(&self, notification: ServerNotification) -> Result<()> {
        self.notifications
            .lock()
            .expect("notifications lock")
            .push(notification);
        Ok(())
    }
}

/// Drain a stream until its terminal frame, with a hang guard.
pub async fn collect_stream(mut rx: mpsc::Receiver<StreamFrame>) -> Vec<StreamFrame> {
    let mut frames = Vec::new();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("stream stalled")
            .expect("stream dropped without terminal frame");
        let done = matches!(
            frame,
            StreamFrame::Completed { .. } | StreamFrame::Failed { .. }
        );
        frames.push(frame);
        if done {
            return frames;
        }
    }
}
