//! Events parsed from the agent CLI's newline-delimited JSON output.
//!
//! Every stdout line maps to exactly one event, except assistant records
//! carrying several `tool_use` blocks, which split into one synthetic
//! [`StreamEventMsg::AssistantToolUse`] per block so UIs can render tool
//! calls incrementally.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// One item in a session's event stream.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StreamEvent {
    /// The CLI-assigned session id, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Monotone receive stamp in epoch milliseconds. Split synthetic events
    /// share the stamp of the record they came from.
    pub received_at_ms: i64,
    /// The raw input line, retained for debugging. Omitted on the wire when
    /// the event parsed cleanly.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(flatten)]
    pub msg: StreamEventMsg,
}

/// Tagged event payload.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEventMsg {
    /// The CLI's `system`/`init` record; carries the authoritative session id.
    SystemInit(SystemInitEvent),

    /// Assistant prose output.
    AssistantText(AssistantTextEvent),

    /// One tool invocation block from an assistant record.
    AssistantToolUse(AssistantToolUseEvent),

    /// Tool output echoed back through a `user` record.
    UserToolResult(UserToolResultEvent),

    /// Terminal record of a turn.
    TurnResult(TurnResultEvent),

    /// Incremental streaming delta (`stream_event` records).
    StreamDelta(StreamDeltaEvent),

    /// Error surfaced by the CLI or synthesized by the gateway.
    Error(ErrorEvent),

    /// In-band status: session binding, interruption notices, permission
    /// requests and other `status_system` records.
    StatusSystem(StatusSystemEvent),

    /// The CLI compacted its conversation history.
    CompactBoundary(CompactBoundaryEvent),

    /// Anything the parser could not classify; never an error.
    Unknown(UnknownEvent),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SystemInitEvent {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AssistantTextEvent {
    pub uuid: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AssistantToolUseEvent {
    /// Derived id `<original-uuid>_tool_<index>` for split records.
    pub uuid: String,
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: Value,
    /// Position of this block within the original record.
    pub block_index: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UserToolResultEvent {
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TurnResultEvent {
    /// `ok`, `interrupted`, `error_during_execution`, ...
    pub subtype: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    /// Token usage block, preserved verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StreamDeltaEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub delta: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ErrorEvent {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StatusSystemEvent {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl StatusSystemEvent {
    /// Status emitted once when the CLI-assigned session id binds.
    pub const SESSION_BOUND: &'static str = "session_bound";
    /// Status carried by reclassified "interrupted by user" stderr lines.
    pub const INTERRUPTED: &'static str = "interrupted";
    /// Status that triggers a `RequestPermission` reverse call.
    pub const PERMISSION_REQUEST: &'static str = "permission_request";
    /// Status published after an `AskUserQuestion` reverse call completes.
    pub const QUESTION_ANSWERED: &'static str = "question_answered";
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CompactBoundaryEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UnknownEvent {
    pub raw: String,
}
