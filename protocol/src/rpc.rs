//! Typed payloads for every RPC method, in both directions.
//!
//! Outbound (client → gateway) methods travel on `agent.<method>` routes;
//! the route names the method, so a frame payload is the bare params object.
//! The [`client_request_definitions!`] macro materializes the method table
//! as a compile-time switch: parsing, method names, and handler kinds all
//! come from one declaration.
//!
//! Request/response methods complete with one `agent.response` frame
//! carrying a [`ResponseEnvelope`]. Request/stream methods (`query`,
//! `queryWithContent`) never receive an `agent.response` on success; items
//! arrive as `agent.stream` frames holding a [`StreamFrame`], and fail-fast
//! errors arrive as an `agent.response` carrying the error envelope.

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use strum_macros::Display;
use uuid::Uuid;

use crate::event::StreamEvent;

/// Correlation id carried in the frame header. Unique per connection for
/// client-originated requests and per session for reverse calls.
pub type CallId = u64;

/// Stable short error code plus a human-readable message. The gateway never
/// puts stack traces or internal state in `message`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

impl RpcError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Completion envelope for `agent.response` and `client.reply` frames.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResponseEnvelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl ResponseEnvelope {
    pub fn ok<T: Serialize>(result: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            success: true,
            result: Some(serde_json::to_value(result)?),
            error: None,
        })
    }

    pub fn err(error: RpcError) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
        }
    }
}

/// Concurrency shape of a method, keyed by route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    RequestResponse,
    RequestStream,
    FireAndForget,
}

/// One item on a request/stream route.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamFrame {
    Item { event: StreamEvent },
    Completed { code: StreamCompletionCode },
    Failed { error: RpcError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StreamCompletionCode {
    /// The turn finished: terminal result seen and child stdout closed.
    Done,
    /// `runInBackground` detached the subscriber; the child keeps running.
    Detached,
}

/// Permission behavior for CLI tool use. The static set here is advisory;
/// `Capabilities::supported_permission_modes` is authoritative at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
    DontAsk,
}

/// Flag set describing what the active session supports.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub can_interrupt: bool,
    pub can_switch_model: bool,
    pub can_switch_permission_mode: bool,
    pub supported_permission_modes: Vec<PermissionMode>,
    pub can_skip_permissions: bool,
    pub can_send_rich_content: bool,
    pub can_think: bool,
    pub can_resume_session: bool,
}

/// Typed user-turn content for `queryWithContent`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Thinking { thinking: String },
    Image { media_type: String, data: String },
}

// ---------------------------------------------------------------------------
// Request params / responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    /// Agent provider tag; only "claude" is currently served.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Absolute project working directory; read-only for session lifetime.
    pub cwd: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<PermissionMode>,
    #[serde(default)]
    pub skip_permissions: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_thinking_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_mode: Option<String>,
    /// Ask the CLI for incremental `stream_event` deltas in addition to the
    /// consolidated records.
    #[serde(default)]
    pub include_partial_messages: bool,
    /// Resume an on-disk session: history is prepended and `--resume` is
    /// passed to the child on the next turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    /// Gateway-assigned handle; present from the first reply and used to
    /// address every later session-scoped method.
    pub gateway_session_id: Uuid,
    /// CLI-assigned id; `None` until the first `system:init` record binds it.
    pub session_id: Option<String>,
    pub capabilities: Capabilities,
    pub model: String,
    pub cwd: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    pub gateway_session_id: Uuid,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryWithContentParams {
    pub gateway_session_id: Uuid,
    pub blocks: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRefParams {
    pub gateway_session_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetModelParams {
    pub gateway_session_id: Uuid,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetModelResponse {
    /// Applied on the next turn.
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPermissionModeParams {
    pub gateway_session_id: Uuid,
    pub mode: PermissionMode,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPermissionModeResponse {
    pub mode: PermissionMode,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetMaxThinkingTokensParams {
    pub gateway_session_id: Uuid,
    /// `None` or `0` disables the cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_thinking_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetMaxThinkingTokensResponse {
    pub max_thinking_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectResponse {}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetHistoryResponse {
    /// The in-memory event log of the current session, in delivery order.
    pub events: Vec<StreamEvent>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadHistoryParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<PathBuf>,
    #[serde(default)]
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadHistoryResponse {
    /// Raw history records in emission order (merged across linked files).
    pub messages: Vec<Value>,
    pub count: usize,
    /// Total records available at read time; shrinks after compaction.
    pub available_count: usize,
    /// True when a compaction was detected since the previous read.
    #[serde(default)]
    pub compacted: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMetadataParams {
    pub session_id: String,
    pub project_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMetadataResponse {
    pub total_lines: usize,
    pub session_id: String,
    pub project_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySessionsParams {
    pub project_path: PathBuf,
    pub max_results: usize,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySessionSummary {
    pub session_id: String,
    pub project_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_user_message: Option<String>,
    pub message_count: usize,
    /// Last modification time, epoch milliseconds.
    pub timestamp_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySessionsResponse {
    pub sessions: Vec<HistorySessionSummary>,
    /// Total discovered before paging.
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TruncateHistoryParams {
    pub session_id: String,
    pub message_uuid: String,
    pub project_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TruncateHistoryResponse {
    pub success: bool,
    pub remaining_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSessionsParams {}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub gateway_session_id: Uuid,
    pub session_id: Option<String>,
    pub state: String,
    pub project_path: PathBuf,
    pub turn_counter: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSessionsResponse {
    pub sessions: Vec<SessionSummary>,
}

// ---------------------------------------------------------------------------
// Method table
// ---------------------------------------------------------------------------

/// Error produced when an inbound frame does not decode into a request.
#[derive(Debug, thiserror::Error)]
pub enum RequestParseError {
    #[error("unknown route: {0}")]
    UnknownRoute(String),
    #[error("bad payload for {method}: {source}")]
    BadPayload {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Generates `enum ClientRequest` with one variant per method the client can
/// send, plus the route → kind table and payload parsing. `response:` records
/// the type completing each method; request/stream methods complete through
/// [`StreamFrame`] items instead of a response envelope.
macro_rules! client_request_definitions {
    (
        $(
            $(#[$variant_meta:meta])*
            $variant:ident, $method:literal, $kind:ident => {
                params: $params:ty,
                response: $response:ty,
            }
        )*
    ) => {
        /// Request from the client to the gateway. The wire method name is
        /// the `agent.` route suffix; the payload is the bare params object.
        #[derive(Debug, Clone, PartialEq)]
        pub enum ClientRequest {
            $(
                $(#[$variant_meta])*
                $variant($params),
            )*
        }

        impl ClientRequest {
            /// Route suffixes of every method, in declaration order.
            pub const METHODS: &'static [&'static str] = &[$($method),*];

            /// Decode the payload of an `agent.<method>` frame.
            pub fn parse(method: &str, payload: &[u8]) -> Result<Self, RequestParseError> {
                match method {
                    $(
                        $method => serde_json::from_slice::<$params>(payload)
                            .map(Self::$variant)
                            .map_err(|source| RequestParseError::BadPayload {
                                method: $method,
                                source,
                            }),
                    )*
                    other => Err(RequestParseError::UnknownRoute(other.to_string())),
                }
            }

            pub fn method(&self) -> &'static str {
                match self {
                    $(Self::$variant(_) => $method,)*
                }
            }

            pub fn kind(&self) -> HandlerKind {
                match self {
                    $(Self::$variant(_) => HandlerKind::$kind,)*
                }
            }

            /// Static route table lookup without decoding a payload.
            pub fn kind_for(method: &str) -> Option<HandlerKind> {
                match method {
                    $($method => Some(HandlerKind::$kind),)*
                    _ => None,
                }
            }
        }
    };
}

client_request_definitions! {
    /// Create a session for a project directory.
    Connect, "connect", RequestResponse => {
        params: ConnectParams,
        response: ConnectResponse,
    }
    /// Send one user turn; stream the decoded events back.
    Query, "query", RequestStream => {
        params: QueryParams,
        response: StreamFrame,
    }
    /// As `query`, with typed content blocks.
    QueryWithContent, "queryWithContent", RequestStream => {
        params: QueryWithContentParams,
        response: StreamFrame,
    }
    /// Gracefully stop the in-flight turn; the stream stays open until EOF.
    Interrupt, "interrupt", RequestResponse => {
        params: SessionRefParams,
        response: StatusResponse,
    }
    /// Detach the current turn; the child keeps running.
    RunInBackground, "runInBackground", RequestResponse => {
        params: SessionRefParams,
        response: StatusResponse,
    }
    SetModel, "setModel", RequestResponse => {
        params: SetModelParams,
        response: SetModelResponse,
    }
    SetPermissionMode, "setPermissionMode", RequestResponse => {
        params: SetPermissionModeParams,
        response: SetPermissionModeResponse,
    }
    SetMaxThinkingTokens, "setMaxThinkingTokens", RequestResponse => {
        params: SetMaxThinkingTokensParams,
        response: SetMaxThinkingTokensResponse,
    }
    /// Close the session. Idempotent.
    Disconnect, "disconnect", RequestResponse => {
        params: SessionRefParams,
        response: DisconnectResponse,
    }
    /// Replay the in-memory event log of the current session.
    GetHistory, "getHistory", RequestResponse => {
        params: SessionRefParams,
        response: GetHistoryResponse,
    }
    /// Read a window from the on-disk session file(s).
    LoadHistory, "loadHistory", RequestResponse => {
        params: LoadHistoryParams,
        response: LoadHistoryResponse,
    }
    GetHistoryMetadata, "getHistoryMetadata", RequestResponse => {
        params: HistoryMetadataParams,
        response: HistoryMetadataResponse,
    }
    /// List discovered on-disk sessions for a project.
    GetHistorySessions, "getHistorySessions", RequestResponse => {
        params: HistorySessionsParams,
        response: HistorySessionsResponse,
    }
    /// Drop the record with `messageUuid` and everything after it.
    TruncateHistory, "truncateHistory", RequestResponse => {
        params: TruncateHistoryParams,
        response: TruncateHistoryResponse,
    }
    /// Enumerate live gateway sessions.
    ListSessions, "listSessions", RequestResponse => {
        params: ListSessionsParams,
        response: ListSessionsResponse,
    }
}

// ---------------------------------------------------------------------------
// Reverse calls (gateway → client)
// ---------------------------------------------------------------------------

/// Call the gateway originates mid-turn and awaits a `client.reply` for.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum ServerRequest {
    AskUserQuestion { params: AskUserQuestionParams },
    RequestPermission { params: RequestPermissionParams },
}

/// Fire-and-forget push from the gateway; no reply expected.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum ServerNotification {
    SessionCommand { params: SessionCommandParams },
    ThemeChanged { params: ThemeChangedParams },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AskUserQuestionParams {
    pub gateway_session_id: Uuid,
    pub questions: Vec<UserQuestion>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuestion {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multi_select: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AskUserQuestionResponse {
    pub answers: Vec<QuestionAnswer>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionAnswer {
    pub question_index: usize,
    pub selected: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPermissionParams {
    pub gateway_session_id: Uuid,
    pub tool_name: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPermissionResponse {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
    /// Rules the client asks the gateway to persist, by scope. Absent means
    /// the decision applies to the current session only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permission_updates: Vec<PermissionUpdate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum PermissionScope {
    UserSettings,
    ProjectSettings,
    LocalSettings,
    Session,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionUpdate {
    pub scope: PermissionScope,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum SessionCommandKind {
    Switch,
    Create,
    Close,
    Rename,
    ToggleHistory,
    SetLocale,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCommandParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_session_id: Option<Uuid>,
    pub command: SessionCommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemeChangedParams {
    /// Opaque theme descriptor forwarded to the client.
    pub theme: Value,
}
