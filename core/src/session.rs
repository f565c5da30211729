//! Per-session state and the cross-session store.
//!
//! A [`SessionHandle`] is the only owner of its mutable state; every
//! mutation goes through the single `Mutex` inside it, and the lock is
//! never held across child I/O or transport writes. Lock order across the
//! gateway is SessionStore → Session → HistoryCache.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::MutexGuard;
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use uuid::Uuid;

use gateway_protocol::event::StreamEvent;
use gateway_protocol::rpc::CallId;
use gateway_protocol::rpc::Capabilities;
use gateway_protocol::rpc::PermissionMode;
use gateway_protocol::rpc::SessionSummary;
use gateway_protocol::rpc::StreamFrame;

use crate::error::GatewayErr;
use crate::error::Result;
use crate::reverse::ClientChannel;
use crate::reverse::PendingCalls;

/// Hard cap on concurrently live sessions.
const MAX_SESSIONS: usize = 10_000;

/// Queue depth per stream subscriber; a subscriber that stays full past the
/// stall timeout costs the session its child.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Idle,
    Streaming,
    Interrupting,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Idle => "idle",
            Self::Streaming => "streaming",
            Self::Interrupting => "interrupting",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-turn configuration; changes apply on the next spawned child.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: String,
    pub permission_mode: PermissionMode,
    pub skip_permissions: bool,
    pub max_thinking_tokens: Option<u64>,
    pub system_prompt: Option<String>,
    pub sandbox_mode: Option<String>,
    pub include_partial_messages: bool,
    /// Session-scoped permission rules accumulated from reverse-call
    /// responses; never persisted to disk.
    pub session_allow_rules: Vec<String>,
    pub session_deny_rules: Vec<String>,
}

/// One subscriber of the current turn's stream.
pub struct Subscriber {
    pub call_id: CallId,
    pub tx: mpsc::Sender<StreamFrame>,
}

/// Mutable session state; see [`SessionHandle`].
pub struct Session {
    pub state: SessionState,
    /// CLI-assigned id. Set at most once; never changes afterwards, even
    /// across interrupts.
    pub session_id: Option<String>,
    pub config: SessionConfig,
    pub subscribers: Vec<Subscriber>,
    pub turn_counter: u64,
    /// Every event delivered this session, for `getHistory` replay.
    pub event_log: Vec<StreamEvent>,
    /// Set by `interrupt` so the turn loop can attribute the child's exit.
    pub interrupt_requested: bool,
    /// Cancelled to ask the current turn to terminate its child; replaced
    /// with a fresh token at every turn start.
    pub interrupt: CancellationToken,
    /// Pid of the turn's live child, while one exists.
    pub child_pid: Option<u32>,
}

impl Session {
    /// Bind the CLI-assigned id. First write wins.
    pub fn bind_session_id(&mut self, id: &str) -> bool {
        if self.session_id.is_some() || id.is_empty() {
            return false;
        }
        self.session_id = Some(id.to_string());
        true
    }
}

pub struct SessionHandle {
    pub gateway_session_id: Uuid,
    /// Owning transport client; disconnect of that client closes us.
    pub client_id: Uuid,
    /// Back-channel to that client for reverse calls and notifications.
    pub channel: Arc<dyn ClientChannel>,
    pub project_path: PathBuf,
    pub capabilities: Capabilities,
    state: Mutex<Session>,
    pub pending_calls: PendingCalls,
    /// Cancelled exactly once, when the session transitions to `Closed`.
    pub closed: CancellationToken,
}

impl SessionHandle {
    pub fn new(
        client_id: Uuid,
        channel: Arc<dyn ClientChannel>,
        project_path: PathBuf,
        capabilities: Capabilities,
        config: SessionConfig,
        resume_session_id: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway_session_id: Uuid::new_v4(),
            client_id,
            channel,
            project_path,
            capabilities,
            state: Mutex::new(Session {
                state: SessionState::Connecting,
                session_id: resume_session_id,
                config,
                subscribers: Vec::new(),
                turn_counter: 0,
                event_log: Vec::new(),
                interrupt_requested: false,
                interrupt: CancellationToken::new(),
                child_pid: None,
            }),
            pending_calls: PendingCalls::default(),
            closed: CancellationToken::new(),
        })
    }

    pub async fn lock(&self) -> MutexGuard<'_, Session> {
        self.state.lock().await
    }

    pub async fn current_state(&self) -> SessionState {
        self.state.lock().await.state
    }

    pub async fn summary(&self) -> SessionSummary {
        let session = self.state.lock().await;
        SessionSummary {
            gateway_session_id: self.gateway_session_id,
            session_id: session.session_id.clone(),
            state: session.state.to_string(),
            project_path: self.project_path.clone(),
            turn_counter: session.turn_counter,
        }
    }

    /// Fail unless the session is in `expected`; used by the fail-fast
    /// method preconditions.
    pub async fn require_state(&self, expected: SessionState) -> Result<()> {
        let session = self.state.lock().await;
        if session.state == expected {
            Ok(())
        } else {
            Err(GatewayErr::WrongState {
                expected: expected.as_str(),
                actual: session.state,
            })
        }
    }
}

/// All live sessions, keyed by gateway session id.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<Uuid, Arc<SessionHandle>>>,
}

impl SessionStore {
    pub async fn insert(&self, handle: Arc<SessionHandle>) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= MAX_SESSIONS {
            return Err(GatewayErr::Overloaded);
        }
        if sessions.contains_key(&handle.gateway_session_id) {
            return Err(GatewayErr::DuplicateSession(
                handle.gateway_session_id.to_string(),
            ));
        }
        sessions.insert(handle.gateway_session_id, handle);
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Arc<SessionHandle>> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(GatewayErr::NotConnected(id))
    }

    pub async fn remove(&self, id: Uuid) -> Option<Arc<SessionHandle>> {
        self.sessions.write().await.remove(&id)
    }

    pub async fn owned_by_client(&self, client_id: Uuid) -> Vec<Arc<SessionHandle>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|handle| handle.client_id == client_id)
            .cloned()
            .collect()
    }

    pub async fn all(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
