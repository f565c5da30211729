use std::io;
use std::time::Duration;

use thiserror::Error;

use gateway_protocol::rpc::RpcError;
use uuid::Uuid;

use crate::session::SessionState;

pub type Result<T> = std::result::Result<T, GatewayErr>;

/// Keep the stderr excerpt attached to crash errors small enough to put in a
/// user-facing message.
const STDERR_TAIL_MAX_BYTES: usize = 2 * 1024;

#[derive(Error, Debug)]
pub enum GatewayErr {
    #[error("agent CLI not found: {0}")]
    CliNotFound(String),

    #[error("failed to spawn agent CLI: {0}")]
    CliSpawnFailed(String),

    /// Child exited non-zero outside of an interrupt/disconnect.
    #[error("agent CLI crashed with exit code {exit_code}")]
    CliCrashed { exit_code: i32, stderr_tail: String },

    #[error("bad options: {0}")]
    BadOptions(String),

    #[error("capability not supported: {0}")]
    UnsupportedCapability(&'static str),

    #[error("unknown route: {0}")]
    UnknownRoute(String),

    #[error("bad payload: {0}")]
    BadPayload(String),

    #[error("no session with id {0}")]
    NotConnected(Uuid),

    #[error("operation requires state {expected}, session is {actual}")]
    WrongState {
        expected: &'static str,
        actual: SessionState,
    },

    #[error("session already exists for {0}")]
    DuplicateSession(String),

    /// The client did not answer a reverse call before the deadline. Never
    /// fatal to the session.
    #[error("client did not respond within {0:?}")]
    ReverseCallTimeout(Duration),

    #[error("session closed")]
    SessionClosed,

    #[error("no history file for session {0}")]
    HistoryFileNotFound(String),

    #[error("message uuid {0} not present in history file")]
    HistoryUuidNotFound(String),

    #[error("history file was compacted during read")]
    HistoryCompactedDuringRead,

    #[error("transport disconnected")]
    TransportDisconnected,

    #[error("cancelled")]
    Cancelled,

    /// A hard cap (pending reverse calls, session count) was hit.
    #[error("too many pending operations, retry later")]
    Overloaded,

    /// Bug. Logged with full context at the emit site; the wire message
    /// stays generic.
    #[error("internal error")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl GatewayErr {
    pub fn crashed(exit_code: i32, stderr_tail: &str) -> Self {
        let tail = if stderr_tail.len() > STDERR_TAIL_MAX_BYTES {
            let mut start = stderr_tail.len() - STDERR_TAIL_MAX_BYTES;
            while !stderr_tail.is_char_boundary(start) {
                start += 1;
            }
            stderr_tail[start..].to_string()
        } else {
            stderr_tail.to_string()
        };
        Self::CliCrashed {
            exit_code,
            stderr_tail: tail,
        }
    }

    /// Stable short code for the wire. New variants must extend this list;
    /// clients match on the code, not the message.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::CliNotFound(_) => "cli_not_found",
            Self::CliSpawnFailed(_) => "cli_spawn_failed",
            Self::CliCrashed { .. } => "cli_crashed",
            Self::BadOptions(_) => "bad_options",
            Self::UnsupportedCapability(_) => "unsupported_capability",
            Self::UnknownRoute(_) => "unknown_route",
            Self::BadPayload(_) => "bad_payload",
            Self::NotConnected(_) => "not_connected",
            Self::WrongState { .. } => "wrong_state",
            Self::DuplicateSession(_) => "duplicate_session",
            Self::ReverseCallTimeout(_) => "reverse_call_timeout",
            Self::SessionClosed => "session_closed",
            Self::HistoryFileNotFound(_) => "history_file_not_found",
            Self::HistoryUuidNotFound(_) => "history_uuid_not_found",
            Self::HistoryCompactedDuringRead => "history_compacted",
            Self::TransportDisconnected => "transport_disconnected",
            Self::Cancelled => "cancelled",
            Self::Overloaded => "overloaded",
            Self::Internal(_) => "internal",
            Self::Io(_) => "io",
            Self::Json(_) => "bad_payload",
        }
    }

    /// Wire representation. Internal errors keep their context out of the
    /// message; it is already in the logs.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            Self::Internal(context) => {
                tracing::error!("internal error surfaced to client: {context}");
                RpcError::new(self.error_code(), "internal error")
            }
            other => RpcError::new(other.error_code(), other.to_string()),
        }
    }
}
