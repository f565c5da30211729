//! Top-level glue: owns the session store and translates RPC methods into
//! supervisor, parser, and history actions.
//!
//! Per-session ordering holds because every turn runs in exactly one task:
//! stream events, reverse-call dispatches and state transitions of a
//! session are serialized there. Session locks are never held across child
//! I/O, subscriber sends, or reverse-call awaits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use uuid::Uuid;

use gateway_protocol::event::ErrorEvent;
use gateway_protocol::event::StatusSystemEvent;
use gateway_protocol::event::StreamEvent;
use gateway_protocol::event::StreamEventMsg;
use gateway_protocol::event::UserToolResultEvent;
use gateway_protocol::rpc::AskUserQuestionParams;
use gateway_protocol::rpc::Capabilities;
use gateway_protocol::rpc::ConnectParams;
use gateway_protocol::rpc::ConnectResponse;
use gateway_protocol::rpc::ContentBlock;
use gateway_protocol::rpc::DisconnectResponse;
use gateway_protocol::rpc::GetHistoryResponse;
use gateway_protocol::rpc::HistoryMetadataParams;
use gateway_protocol::rpc::HistoryMetadataResponse;
use gateway_protocol::rpc::HistorySessionsParams;
use gateway_protocol::rpc::HistorySessionsResponse;
use gateway_protocol::rpc::ListSessionsResponse;
use gateway_protocol::rpc::LoadHistoryParams;
use gateway_protocol::rpc::LoadHistoryResponse;
use gateway_protocol::rpc::PermissionMode;
use gateway_protocol::rpc::PermissionScope;
use gateway_protocol::rpc::QueryParams;
use gateway_protocol::rpc::QueryWithContentParams;
use gateway_protocol::rpc::RequestPermissionParams;
use gateway_protocol::rpc::RequestPermissionResponse;
use gateway_protocol::rpc::ServerNotification;
use gateway_protocol::rpc::ServerRequest;
use gateway_protocol::rpc::SessionCommandKind;
use gateway_protocol::rpc::SessionCommandParams;
use gateway_protocol::rpc::SessionRefParams;
use gateway_protocol::rpc::SetMaxThinkingTokensParams;
use gateway_protocol::rpc::SetMaxThinkingTokensResponse;
use gateway_protocol::rpc::SetModelParams;
use gateway_protocol::rpc::SetModelResponse;
use gateway_protocol::rpc::SetPermissionModeParams;
use gateway_protocol::rpc::SetPermissionModeResponse;
use gateway_protocol::rpc::StatusResponse;
use gateway_protocol::rpc::StreamCompletionCode;
use gateway_protocol::rpc::StreamFrame;
use gateway_protocol::rpc::TruncateHistoryParams;
use gateway_protocol::rpc::TruncateHistoryResponse;

use crate::config::Config;
use crate::config::DEFAULT_MODEL;
use crate::error::GatewayErr;
use crate::error::Result;
use crate::history::HistoryResolver;
use crate::parser::StreamParser;
use crate::permissions::persist_update;
use crate::process::ChildLine;
use crate::process::OutputStream;
use crate::process::SupervisedChild;
use crate::process::Supervisor;
use crate::reverse;
use crate::reverse::ClientChannel;
use crate::session::Session;
use crate::session::SessionConfig;
use crate::session::SessionHandle;
use crate::session::SessionState;
use crate::session::SessionStore;
use crate::session::Subscriber;
use crate::spawn::SpawnSpec;

/// How long a full subscriber queue may stall a turn before the session is
/// closed. Losing output is never silent.
const SUBSCRIBER_STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Recent stderr lines attached to a crash report.
const STDERR_TAIL_LINES: usize = 20;

/// What the gateway can do for a Claude-style CLI session. The permission
/// mode list is authoritative at runtime; `dontAsk` stays out of it.
pub fn default_capabilities() -> Capabilities {
    Capabilities {
        can_interrupt: true,
        can_switch_model: true,
        can_switch_permission_mode: true,
        supported_permission_modes: vec![
            PermissionMode::Default,
            PermissionMode::AcceptEdits,
            PermissionMode::Plan,
            PermissionMode::BypassPermissions,
        ],
        can_skip_permissions: true,
        // The user turn travels on the child's argv; binary content does not.
        can_send_rich_content: false,
        can_think: true,
        can_resume_session: true,
    }
}

pub struct Orchestrator {
    config: Arc<Config>,
    store: Arc<SessionStore>,
    supervisor: Supervisor,
    history: HistoryResolver,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        let history = HistoryResolver::new(config.claude_home.clone());
        let supervisor = Supervisor::new(config.grace_period);
        Self {
            config: Arc::new(config),
            store: Arc::new(SessionStore::default()),
            supervisor,
            history,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    // -----------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------

    pub async fn connect(
        &self,
        client_id: Uuid,
        channel: Arc<dyn ClientChannel>,
        params: ConnectParams,
    ) -> Result<ConnectResponse> {
        if let Some(provider) = &params.provider {
            if provider != "claude" {
                return Err(GatewayErr::BadOptions(format!(
                    "unsupported provider: {provider}"
                )));
            }
        }
        if !params.cwd.is_absolute() {
            return Err(GatewayErr::BadOptions(format!(
                "cwd must be absolute, got {}",
                params.cwd.display()
            )));
        }
        self.locate_cli()?;

        let capabilities = default_capabilities();
        let model = match &params.model {
            Some(name) => self
                .config
                .resolve_model(name)
                .ok_or_else(|| GatewayErr::BadOptions(format!("unknown model: {name}")))?,
            None => DEFAULT_MODEL.to_string(),
        };
        let permission_mode = params.permission_mode.unwrap_or(PermissionMode::Default);
        if !capabilities
            .supported_permission_modes
            .contains(&permission_mode)
        {
            return Err(GatewayErr::BadOptions(format!(
                "permission mode {permission_mode} is not supported"
            )));
        }

        let config = SessionConfig {
            model: model.clone(),
            permission_mode,
            skip_permissions: params.skip_permissions,
            max_thinking_tokens: params.max_thinking_tokens,
            system_prompt: params.system_prompt.clone(),
            sandbox_mode: params.sandbox_mode.clone(),
            include_partial_messages: params.include_partial_messages,
            session_allow_rules: Vec::new(),
            session_deny_rules: Vec::new(),
        };

        let handle = SessionHandle::new(
            client_id,
            channel,
            params.cwd.clone(),
            capabilities.clone(),
            config,
            params.resume_session_id.clone(),
        );
        self.store.insert(handle.clone()).await?;

        if let Some(resume_id) = &params.resume_session_id {
            self.prepend_resumed_history(&handle, resume_id).await;
        }

        let session_id = {
            let mut session = handle.lock().await;
            session.state = SessionState::Idle;
            session.session_id.clone()
        };

        info!(
            gateway_session_id = %handle.gateway_session_id,
            cwd = %params.cwd.display(),
            resumed = params.resume_session_id.is_some(),
            "session connected"
        );
        Ok(ConnectResponse {
            gateway_session_id: handle.gateway_session_id,
            session_id,
            capabilities,
            model,
            cwd: params.cwd,
        })
    }

    /// Replay the on-disk record log into the in-memory event log so
    /// `getHistory` covers the resumed prefix.
    async fn prepend_resumed_history(&self, handle: &Arc<SessionHandle>, resume_id: &str) {
        let request = LoadHistoryParams {
            session_id: Some(resume_id.to_string()),
            project_path: Some(handle.project_path.clone()),
            offset: 0,
            limit: usize::MAX,
        };
        match self.history.load(&request).await {
            Ok(loaded) => {
                let mut parser = StreamParser::new(Some(resume_id.to_string()));
                let mut session = handle.lock().await;
                for record in &loaded.messages {
                    let line = record.to_string();
                    session.event_log.extend(parser.parse_stdout_line(&line));
                }
                debug!(resume_id, records = loaded.count, "prepended resumed history");
            }
            Err(err) => {
                // The CLI may still know the session; resume is its call.
                warn!(resume_id, "could not preload history: {err}");
            }
        }
    }

    pub async fn disconnect(&self, params: SessionRefParams) -> Result<DisconnectResponse> {
        match self.store.get(params.gateway_session_id).await {
            Ok(handle) => {
                close_session(&self.store, &handle).await;
                Ok(DisconnectResponse {})
            }
            // Idempotent: a second disconnect finds nothing and succeeds.
            Err(GatewayErr::NotConnected(_)) => Ok(DisconnectResponse {}),
            Err(err) => Err(err),
        }
    }

    /// Transport-level disconnect: close every session owned by `client_id`.
    pub async fn on_client_disconnect(&self, client_id: Uuid) {
        let owned = self.store.owned_by_client(client_id).await;
        if owned.is_empty() {
            return;
        }
        info!(%client_id, sessions = owned.len(), "client disconnected, closing sessions");
        for handle in owned {
            close_session(&self.store, &handle).await;
        }
    }

    // -----------------------------------------------------------------
    // Turns
    // -----------------------------------------------------------------

    pub async fn query(&self, params: QueryParams, subscriber: Subscriber) -> Result<()> {
        self.start_turn(params.gateway_session_id, params.message, subscriber)
            .await
    }

    pub async fn query_with_content(
        &self,
        params: QueryWithContentParams,
        subscriber: Subscriber,
    ) -> Result<()> {
        let message = render_content_blocks(&params.blocks)?;
        self.start_turn(params.gateway_session_id, message, subscriber)
            .await
    }

    async fn start_turn(
        &self,
        gateway_session_id: Uuid,
        message: String,
        subscriber: Subscriber,
    ) -> Result<()> {
        let handle = self.store.get(gateway_session_id).await?;

        let spec = {
            let mut session = handle.lock().await;
            if session.state != SessionState::Idle {
                return Err(GatewayErr::WrongState {
                    expected: SessionState::Idle.as_str(),
                    actual: session.state,
                });
            }
            session.state = SessionState::Streaming;
            session.turn_counter += 1;
            session.interrupt_requested = false;
            session.interrupt = CancellationToken::new();
            session.subscribers.push(subscriber);
            self.spawn_spec(&handle, &session, message)
        };

        let child = match self
            .supervisor
            .spawn(&spec, handle.gateway_session_id)
            .await
        {
            Ok(child) => child,
            Err(err) => {
                // No child input was written; the turn never started.
                let mut session = handle.lock().await;
                session.state = SessionState::Idle;
                session.subscribers.clear();
                session.turn_counter -= 1;
                return Err(err);
            }
        };

        {
            let mut session = handle.lock().await;
            session.child_pid = child.pid();
        }

        let driver = TurnDriver {
            config: self.config.clone(),
            store: self.store.clone(),
            handle,
        };
        tokio::spawn(async move {
            driver.run_turn(child).await;
        });
        Ok(())
    }

    fn spawn_spec(
        &self,
        handle: &Arc<SessionHandle>,
        session: &Session,
        message: String,
    ) -> SpawnSpec {
        SpawnSpec {
            program: self.config.claude_bin.clone(),
            cwd: handle.project_path.clone(),
            message,
            model: session.config.model.clone(),
            permission_mode: session.config.permission_mode,
            skip_permissions: session.config.skip_permissions,
            max_thinking_tokens: session.config.max_thinking_tokens,
            system_prompt: session.config.system_prompt.clone(),
            include_partial_messages: session.config.include_partial_messages,
            resume_session_id: session.session_id.clone(),
            extra_env: HashMap::new(),
        }
    }

    pub async fn interrupt(&self, params: SessionRefParams) -> Result<StatusResponse> {
        let handle = self.store.get(params.gateway_session_id).await?;
        let token = {
            let mut session = handle.lock().await;
            match session.state {
                SessionState::Streaming => {
                    session.state = SessionState::Interrupting;
                    session.interrupt_requested = true;
                    Some(session.interrupt.clone())
                }
                // Idempotent while an interrupt is already in flight.
                SessionState::Interrupting => None,
                other => {
                    return Err(GatewayErr::WrongState {
                        expected: SessionState::Streaming.as_str(),
                        actual: other,
                    });
                }
            }
        };
        if let Some(token) = token {
            token.cancel();
        }
        Ok(StatusResponse {
            status: "interrupting".to_string(),
        })
    }

    pub async fn run_in_background(&self, params: SessionRefParams) -> Result<StatusResponse> {
        let handle = self.store.get(params.gateway_session_id).await?;
        let subscribers = {
            let mut session = handle.lock().await;
            if session.state != SessionState::Streaming {
                return Err(GatewayErr::WrongState {
                    expected: SessionState::Streaming.as_str(),
                    actual: session.state,
                });
            }
            std::mem::take(&mut session.subscribers)
        };
        for subscriber in subscribers {
            let _ = subscriber
                .tx
                .send(StreamFrame::Completed {
                    code: StreamCompletionCode::Detached,
                })
                .await;
        }
        Ok(StatusResponse {
            status: "detached".to_string(),
        })
    }

    // -----------------------------------------------------------------
    // Session configuration
    // -----------------------------------------------------------------

    pub async fn set_model(&self, params: SetModelParams) -> Result<SetModelResponse> {
        let handle = self.store.get(params.gateway_session_id).await?;
        if !handle.capabilities.can_switch_model {
            return Err(GatewayErr::UnsupportedCapability("canSwitchModel"));
        }
        let model = self
            .config
            .resolve_model(&params.model)
            .ok_or_else(|| {
                let model = &params.model;
                GatewayErr::BadOptions(format!("unknown model: {model}"))
            })?;
        let mut session = handle.lock().await;
        session.config.model = model.clone();
        Ok(SetModelResponse { model })
    }

    pub async fn set_permission_mode(
        &self,
        params: SetPermissionModeParams,
    ) -> Result<SetPermissionModeResponse> {
        let handle = self.store.get(params.gateway_session_id).await?;
        if !handle.capabilities.can_switch_permission_mode {
            return Err(GatewayErr::UnsupportedCapability("canSwitchPermissionMode"));
        }
        if !handle
            .capabilities
            .supported_permission_modes
            .contains(&params.mode)
        {
            return Err(GatewayErr::UnsupportedCapability("permissionMode"));
        }
        let mut session = handle.lock().await;
        session.config.permission_mode = params.mode;
        Ok(SetPermissionModeResponse { mode: params.mode })
    }

    pub async fn set_max_thinking_tokens(
        &self,
        params: SetMaxThinkingTokensParams,
    ) -> Result<SetMaxThinkingTokensResponse> {
        let handle = self.store.get(params.gateway_session_id).await?;
        // Zero and null both mean "no cap".
        let tokens = params.max_thinking_tokens.filter(|&n| n > 0);
        let mut session = handle.lock().await;
        session.config.max_thinking_tokens = tokens;
        Ok(SetMaxThinkingTokensResponse {
            max_thinking_tokens: tokens,
        })
    }

    // -----------------------------------------------------------------
    // History
    // -----------------------------------------------------------------

    pub async fn get_history(&self, params: SessionRefParams) -> Result<GetHistoryResponse> {
        let handle = self.store.get(params.gateway_session_id).await?;
        let session = handle.lock().await;
        Ok(GetHistoryResponse {
            events: session.event_log.clone(),
        })
    }

    pub async fn load_history(&self, params: LoadHistoryParams) -> Result<LoadHistoryResponse> {
        self.history.load(&params).await
    }

    pub async fn get_history_metadata(
        &self,
        params: HistoryMetadataParams,
    ) -> Result<HistoryMetadataResponse> {
        self.history
            .metadata(&params.session_id, &params.project_path)
            .await
    }

    pub async fn get_history_sessions(
        &self,
        params: HistorySessionsParams,
    ) -> Result<HistorySessionsResponse> {
        self.history
            .list_sessions(&params.project_path, params.max_results, params.offset)
            .await
    }

    pub async fn truncate_history(
        &self,
        params: TruncateHistoryParams,
    ) -> Result<TruncateHistoryResponse> {
        self.history
            .truncate(&params.session_id, &params.project_path, &params.message_uuid)
            .await
    }

    pub async fn list_sessions(&self) -> Result<ListSessionsResponse> {
        let mut sessions = Vec::new();
        for handle in self.store.all().await {
            sessions.push(handle.summary().await);
        }
        sessions.sort_by_key(|s| s.gateway_session_id);
        Ok(ListSessionsResponse { sessions })
    }

    /// Route a `client.reply` frame to the session that issued the call.
    /// Call ids are globally unique, so scanning the (small) session set is
    /// unambiguous; a reply that matches nothing was late or fabricated.
    pub async fn complete_reverse_call(
        &self,
        call_id: gateway_protocol::rpc::CallId,
        reply: gateway_protocol::rpc::ResponseEnvelope,
    ) {
        for handle in self.store.all().await {
            if handle
                .pending_calls
                .try_complete(call_id, reply.clone())
                .await
            {
                return;
            }
        }
        warn!(call_id, "dropping reply to unknown or expired reverse call");
    }

    fn locate_cli(&self) -> Result<()> {
        let bin = &self.config.claude_bin;
        if bin.is_absolute() {
            if bin.is_file() {
                return Ok(());
            }
            return Err(GatewayErr::CliNotFound(bin.display().to_string()));
        }
        which::which(bin)
            .map(|_| ())
            .map_err(|_| GatewayErr::CliNotFound(bin.display().to_string()))
    }
}

/// Transition a session to `Closed`: drain subscribers and pending reverse
/// calls, drop it from the store, and tell the client. The turn loop (if
/// any) sees the closed token and walks the child through graceful-then-
/// forceful termination.
async fn close_session(store: &SessionStore, handle: &Arc<SessionHandle>) {
    let subscribers = {
        let mut session = handle.lock().await;
        if session.state == SessionState::Closed {
            return;
        }
        session.state = SessionState::Closed;
        std::mem::take(&mut session.subscribers)
    };

    handle.closed.cancel();
    handle.pending_calls.drain_with_session_closed().await;

    let error = GatewayErr::SessionClosed.to_rpc_error();
    for subscriber in subscribers {
        let _ = subscriber
            .tx
            .send(StreamFrame::Failed {
                error: error.clone(),
            })
            .await;
    }

    store.remove(handle.gateway_session_id).await;

    // Best-effort push so a still-connected UI drops the session too.
    let _ = handle
        .channel
        .send_notification(ServerNotification::SessionCommand {
            params: SessionCommandParams {
                gateway_session_id: Some(handle.gateway_session_id),
                command: SessionCommandKind::Close,
                argument: None,
            },
        })
        .await;
    info!(gateway_session_id = %handle.gateway_session_id, "session closed");
}

/// Runs one turn on its own task, holding clones of everything the turn
/// needs so the orchestrator itself stays behind plain references.
struct TurnDriver {
    config: Arc<Config>,
    store: Arc<SessionStore>,
    handle: Arc<SessionHandle>,
}

impl TurnDriver {
    /// One turn: pump child output through the parser, deliver events,
    /// handle reverse-call hooks, then settle the state machine.
    async fn run_turn(&self, mut child: SupervisedChild) {
        let (mut parser, interrupt_token) = {
            let session = self.handle.lock().await;
            (
                StreamParser::new(session.session_id.clone()),
                session.interrupt.clone(),
            )
        };
        let closed_token = self.handle.closed.clone();

        let mut saw_result = false;
        let mut interrupt_armed = false;
        let mut close_armed = false;
        // Recent stderr, kept for the crash report.
        let mut stderr_tail: Vec<String> = Vec::new();

        loop {
            tokio::select! {
                line = child.next_line() => {
                    let Some(ChildLine { stream, line }) = line else {
                        break;
                    };
                    match stream {
                        OutputStream::Stdout => {
                            for event in parser.parse_stdout_line(&line) {
                                if matches!(event.msg, StreamEventMsg::TurnResult(_)) {
                                    saw_result = true;
                                }
                                self.handle_turn_event(&parser, event).await;
                            }
                        }
                        OutputStream::Stderr => match parser.parse_stderr_line(&line) {
                            Some(event) => {
                                self.handle_turn_event(&parser, event).await;
                            }
                            None => {
                                debug!(
                                    gateway_session_id = %self.handle.gateway_session_id,
                                    "child stderr: {line}"
                                );
                                if stderr_tail.len() == STDERR_TAIL_LINES {
                                    stderr_tail.remove(0);
                                }
                                stderr_tail.push(line);
                            }
                        },
                    }
                }
                _ = interrupt_token.cancelled(), if !interrupt_armed => {
                    interrupt_armed = true;
                    child.request_terminate(false).await;
                    // The stream stays open: the CLI gets to flush its final
                    // interrupted records before EOF closes it.
                }
                _ = closed_token.cancelled(), if !close_armed => {
                    close_armed = true;
                    child.request_terminate(false).await;
                }
            }
        }

        let exit = child.wait().await;

        let (subscribers, crash) = {
            let mut session = self.handle.lock().await;
            let closing = session.state == SessionState::Closed;
            let crash = match &exit {
                Ok(status) if !status.success() => {
                    let interrupted = session.interrupt_requested || interrupt_armed;
                    if closing || interrupted || saw_result {
                        None
                    } else {
                        Some(GatewayErr::crashed(
                            status.code().unwrap_or(-1),
                            &stderr_tail.join("\n"),
                        ))
                    }
                }
                Ok(_) => None,
                Err(err) => Some(GatewayErr::Internal(format!("wait failed: {err}"))),
            };

            session.child_pid = None;
            if closing {
                (Vec::new(), None)
            } else {
                session.state = SessionState::Idle;
                session.interrupt_requested = false;
                (std::mem::take(&mut session.subscribers), crash)
            }
        };

        if let Some(crash) = &crash {
            warn!(
                gateway_session_id = %self.handle.gateway_session_id,
                "child crashed: {crash}"
            );
            let event = StreamEvent {
                session_id: parser.session_id().map(str::to_string),
                received_at_ms: parser.next_stamp(),
                raw: None,
                msg: StreamEventMsg::Error(ErrorEvent {
                    message: crash.to_rpc_error().message,
                }),
            };
            self.handle.lock().await.event_log.push(event.clone());
            for subscriber in &subscribers {
                let _ = subscriber
                    .tx
                    .send(StreamFrame::Item {
                        event: event.clone(),
                    })
                    .await;
            }
        }

        for subscriber in subscribers {
            let _ = subscriber
                .tx
                .send(StreamFrame::Completed {
                    code: StreamCompletionCode::Done,
                })
                .await;
        }
    }

    /// Log, deliver, and run the reverse-call hooks for one event.
    async fn handle_turn_event(&self, parser: &StreamParser, event: StreamEvent) {
        let mut bound_now: Option<String> = None;
        let subscribers = {
            let mut session = self.handle.lock().await;
            if let Some(parsed_id) = parser.session_id() {
                if session.bind_session_id(parsed_id) {
                    bound_now = Some(parsed_id.to_string());
                }
            }
            session.event_log.push(event.clone());
            session
                .subscribers
                .iter()
                .map(|s| s.tx.clone())
                .collect::<Vec<_>>()
        };

        self.deliver(&subscribers, &event).await;

        if let Some(session_id) = bound_now {
            let bound_event = StreamEvent {
                session_id: Some(session_id.clone()),
                received_at_ms: event.received_at_ms,
                raw: None,
                msg: StreamEventMsg::StatusSystem(StatusSystemEvent {
                    status: StatusSystemEvent::SESSION_BOUND.to_string(),
                    payload: Some(serde_json::json!({ "session_id": session_id })),
                }),
            };
            self.handle.lock().await.event_log.push(bound_event.clone());
            self.deliver(&subscribers, &bound_event).await;
        }

        match &event.msg {
            StreamEventMsg::StatusSystem(status)
                if status.status == StatusSystemEvent::PERMISSION_REQUEST =>
            {
                self.permission_flow(&subscribers, &event, status.payload.as_ref())
                    .await;
            }
            StreamEventMsg::AssistantToolUse(tool) if tool.tool_name == "AskUserQuestion" => {
                self.ask_user_flow(&subscribers, &event, &tool.input)
                    .await;
            }
            _ => {}
        }
    }

    /// Push one event to every subscriber. A closed receiver is dropped
    /// from the session (the turn survives); a stalled one closes the
    /// session.
    async fn deliver(&self, subscribers: &[mpsc::Sender<StreamFrame>], event: &StreamEvent) {
        for tx in subscribers {
            let frame = StreamFrame::Item {
                event: event.clone(),
            };
            match tx.send_timeout(frame, SUBSCRIBER_STALL_TIMEOUT).await {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    // Dropping a subscriber must not kill the turn.
                    let mut session = self.handle.lock().await;
                    session.subscribers.retain(|s| !s.tx.same_channel(tx));
                }
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    warn!(
                        gateway_session_id = %self.handle.gateway_session_id,
                        "subscriber stalled; closing session rather than dropping output"
                    );
                    close_session(&self.store, &self.handle).await;
                    return;
                }
            }
        }
    }

    /// `RequestPermission` round-trip triggered by an in-band status record.
    async fn permission_flow(
        &self,
        subscribers: &[mpsc::Sender<StreamFrame>],
        event: &StreamEvent,
        payload: Option<&Value>,
    ) {
        let tool_name = payload
            .and_then(|p| p.get("tool_name").or_else(|| p.get("toolName")))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let input = payload
            .and_then(|p| p.get("input"))
            .cloned()
            .unwrap_or(Value::Null);
        let tool_use_id = payload
            .and_then(|p| p.get("tool_use_id").or_else(|| p.get("toolUseId")))
            .and_then(Value::as_str)
            .map(str::to_string);

        let request = ServerRequest::RequestPermission {
            params: RequestPermissionParams {
                gateway_session_id: self.handle.gateway_session_id,
                tool_name: tool_name.clone(),
                input,
                tool_use_id: tool_use_id.clone(),
            },
        };

        let outcome = reverse::call(
            self.handle.channel.as_ref(),
            &self.handle.pending_calls,
            request,
            self.config.reverse_call_timeout,
        )
        .await;

        let response = match outcome {
            Ok(value) => match serde_json::from_value::<RequestPermissionResponse>(value) {
                Ok(response) => response,
                Err(err) => {
                    warn!("malformed permission response: {err}");
                    denied_response("malformed client response")
                }
            },
            Err(GatewayErr::ReverseCallTimeout(_)) => {
                denied_response("permission request timed out")
            }
            Err(err) => {
                warn!("permission reverse call failed: {err}");
                denied_response("permission request failed")
            }
        };

        for update in &response.permission_updates {
            if update.scope == PermissionScope::Session {
                let mut session = self.handle.lock().await;
                session
                    .config
                    .session_allow_rules
                    .extend(update.allow.iter().cloned());
                session
                    .config
                    .session_deny_rules
                    .extend(update.deny.iter().cloned());
            } else if let Err(err) =
                persist_update(update, &self.config.claude_home, &self.handle.project_path).await
            {
                warn!(scope = %update.scope, "could not persist permission update: {err}");
            }
        }

        if !response.approved {
            let reason = response
                .deny_reason
                .unwrap_or_else(|| "denied by user".to_string());
            let denial = StreamEvent {
                session_id: event.session_id.clone(),
                received_at_ms: event.received_at_ms,
                raw: None,
                msg: StreamEventMsg::UserToolResult(UserToolResultEvent {
                    uuid: format!("{}_denied", tool_use_id.as_deref().unwrap_or(&tool_name)),
                    tool_use_id,
                    content: format!("Permission denied: {reason}"),
                    is_error: true,
                }),
            };
            self.handle.lock().await.event_log.push(denial.clone());
            self.deliver(subscribers, &denial).await;
        }
    }

    /// `AskUserQuestion` round-trip triggered by the matching tool-use
    /// block.
    async fn ask_user_flow(
        &self,
        subscribers: &[mpsc::Sender<StreamFrame>],
        event: &StreamEvent,
        input: &Value,
    ) {
        let questions = input
            .get("questions")
            .cloned()
            .and_then(|qs| serde_json::from_value(qs).ok())
            .unwrap_or_default();

        let request = ServerRequest::AskUserQuestion {
            params: AskUserQuestionParams {
                gateway_session_id: self.handle.gateway_session_id,
                questions,
            },
        };

        let payload = match reverse::call(
            self.handle.channel.as_ref(),
            &self.handle.pending_calls,
            request,
            self.config.reverse_call_timeout,
        )
        .await
        {
            Ok(answers) => serde_json::json!({ "answers": answers }),
            Err(err) => {
                warn!("ask-user reverse call failed: {err}");
                serde_json::json!({ "error": err.to_rpc_error() })
            }
        };

        let answered = StreamEvent {
            session_id: event.session_id.clone(),
            received_at_ms: event.received_at_ms,
            raw: None,
            msg: StreamEventMsg::StatusSystem(StatusSystemEvent {
                status: StatusSystemEvent::QUESTION_ANSWERED.to_string(),
                payload: Some(payload),
            }),
        };
        self.handle.lock().await.event_log.push(answered.clone());
        self.deliver(subscribers, &answered).await;
    }
}

/// The safe default whenever the client cannot or does not answer.
fn denied_response(reason: &str) -> RequestPermissionResponse {
    RequestPermissionResponse {
        approved: false,
        deny_reason: Some(reason.to_string()),
        updated_input: None,
        permission_updates: Vec::new(),
    }
}

fn render_content_blocks(blocks: &[ContentBlock]) -> Result<String> {
    let mut parts = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text } => parts.push(text.as_str()),
            // Thinking blocks guide the model through context, not input.
            ContentBlock::Thinking { .. } => {}
            ContentBlock::Image { .. } => {
                return Err(GatewayErr::UnsupportedCapability("canSendRichContent"));
            }
        }
    }
    if parts.is_empty() {
        return Err(GatewayErr::BadOptions(
            "content blocks carry no text".to_string(),
        ));
    }
    Ok(parts.join("\n\n"))
}
