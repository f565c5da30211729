//! Classifies the agent CLI's stdout into typed stream events.
//!
//! Input lines arrive scrubbed of terminal escapes, then go through a
//! two-layer discriminator: the `type` field first, `subtype` second, with
//! a `message.role` heuristic as fallback. Anything unparseable becomes an
//! `Unknown` event; a malformed line never fails a stream.
//!
//! Assistant records carrying several `tool_use` blocks split into one
//! synthetic event per block, ids `<uuid>_tool_<index>`, all sharing the
//! original record's receive stamp.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde_json::Value;
use tracing::warn;

use gateway_ansi_scrub::scrub;
use gateway_protocol::event::AssistantTextEvent;
use gateway_protocol::event::AssistantToolUseEvent;
use gateway_protocol::event::CompactBoundaryEvent;
use gateway_protocol::event::ErrorEvent;
use gateway_protocol::event::StatusSystemEvent;
use gateway_protocol::event::StreamDeltaEvent;
use gateway_protocol::event::StreamEvent;
use gateway_protocol::event::StreamEventMsg;
use gateway_protocol::event::SystemInitEvent;
use gateway_protocol::event::TurnResultEvent;
use gateway_protocol::event::UnknownEvent;
use gateway_protocol::event::UserToolResultEvent;

/// Lines longer than this are not parsed; they surface as `Unknown`.
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Substring on stderr that marks a user interrupt rather than a failure.
const INTERRUPT_MARKER: &str = "interrupted by user";

/// Per-turn parser. Owns the monotone receive-stamp guarantee and the
/// first-write-wins capture of the CLI-assigned session id.
pub struct StreamParser {
    session_id: Option<String>,
    last_stamp_ms: i64,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new(None)
    }
}

impl StreamParser {
    pub fn new(session_id: Option<String>) -> Self {
        Self {
            session_id,
            last_stamp_ms: 0,
        }
    }

    /// The authoritative session id, once a `system:init` record was seen
    /// (or the parser was seeded by a resume).
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Parse one stdout line into its events, in block order.
    pub fn parse_stdout_line(&mut self, input: &str) -> Vec<StreamEvent> {
        let stamp = self.next_stamp();
        let scrubbed = scrub(input);
        let line = scrubbed.trim();

        if line.is_empty() || !line.starts_with('{') || line.len() > MAX_LINE_BYTES {
            return vec![self.unknown(input, stamp)];
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(Value::Object(map)) => Value::Object(map),
            Ok(_) | Err(_) => return vec![self.unknown(input, stamp)],
        };

        let record_session_id = value
            .get("session_id")
            .or_else(|| value.get("sessionId"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let record_type = value.get("type").and_then(Value::as_str);
        let subtype = value.get("subtype").and_then(Value::as_str);

        let msgs = match (record_type, subtype) {
            (Some("system"), Some("init")) => {
                let init = self.parse_system_init(&value);
                vec![StreamEventMsg::SystemInit(init)]
            }
            (Some("system"), Some("compact_boundary")) | (Some("compact_boundary"), _) => {
                vec![StreamEventMsg::CompactBoundary(parse_compact_boundary(
                    &value,
                ))]
            }
            (Some("system"), sub) | (Some("status_system"), sub) => {
                let status = value
                    .get("status")
                    .and_then(Value::as_str)
                    .or(sub)
                    .unwrap_or("unknown")
                    .to_string();
                vec![StreamEventMsg::StatusSystem(StatusSystemEvent {
                    status,
                    payload: Some(value.clone()),
                })]
            }
            (Some("assistant"), _) => parse_assistant(&value),
            (Some("user"), _) => parse_user(&value),
            (Some("tool_result"), _) => vec![parse_tool_result_record(&value)],
            (Some("result"), sub) => vec![StreamEventMsg::TurnResult(parse_result(&value, sub))],
            (Some("error"), _) => {
                let message = value
                    .get("message")
                    .and_then(Value::as_str)
                    .or_else(|| {
                        value
                            .get("error")
                            .and_then(|e| e.get("message"))
                            .and_then(Value::as_str)
                    })
                    .unwrap_or(line)
                    .to_string();
                vec![StreamEventMsg::Error(ErrorEvent { message })]
            }
            (Some("stream_event"), _) => {
                let delta = value.get("event").cloned().unwrap_or_else(|| value.clone());
                vec![StreamEventMsg::StreamDelta(StreamDeltaEvent {
                    uuid: value.get("uuid").and_then(Value::as_str).map(str::to_string),
                    delta,
                })]
            }
            (Some("summary"), _) => vec![StreamEventMsg::StatusSystem(StatusSystemEvent {
                status: "summary".to_string(),
                payload: Some(value.clone()),
            })],
            _ => match value
                .get("message")
                .and_then(|m| m.get("role"))
                .and_then(Value::as_str)
            {
                Some("assistant") => parse_assistant(&value),
                Some("user") => parse_user(&value),
                _ => vec![StreamEventMsg::Unknown(UnknownEvent {
                    raw: input.to_string(),
                })],
            },
        };

        let session_id = record_session_id.or_else(|| self.session_id.clone());
        msgs.into_iter()
            .map(|msg| StreamEvent {
                session_id: session_id.clone(),
                received_at_ms: stamp,
                raw: Some(input.to_string()),
                msg,
            })
            .collect()
    }

    /// Parse one stderr line. Lines announcing a user interrupt become an
    /// in-band status event; everything else is the caller's to log.
    pub fn parse_stderr_line(&mut self, input: &str) -> Option<StreamEvent> {
        let scrubbed = scrub(input);
        if !scrubbed.contains(INTERRUPT_MARKER) {
            return None;
        }
        let stamp = self.next_stamp();
        Some(StreamEvent {
            session_id: self.session_id.clone(),
            received_at_ms: stamp,
            raw: Some(input.to_string()),
            msg: StreamEventMsg::StatusSystem(StatusSystemEvent {
                status: StatusSystemEvent::INTERRUPTED.to_string(),
                payload: Some(Value::String(scrubbed.into_owned())),
            }),
        })
    }

    fn parse_system_init(&mut self, value: &Value) -> SystemInitEvent {
        let session_id = value
            .get("session_id")
            .or_else(|| value.get("sessionId"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if self.session_id.is_none() && !session_id.is_empty() {
            self.session_id = Some(session_id.clone());
        } else if let Some(bound) = &self.session_id {
            if bound != &session_id && !session_id.is_empty() {
                warn!(bound, new = session_id, "ignoring competing session id");
            }
        }
        SystemInitEvent {
            session_id,
            model: value.get("model").and_then(Value::as_str).map(str::to_string),
            permission_mode: value
                .get("permissionMode")
                .or_else(|| value.get("permission_mode"))
                .and_then(Value::as_str)
                .map(str::to_string),
            cwd: value.get("cwd").and_then(Value::as_str).map(str::to_string),
            tools: value
                .get("tools")
                .and_then(Value::as_array)
                .map(|tools| {
                    tools
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    fn unknown(&self, raw: &str, stamp: i64) -> StreamEvent {
        StreamEvent {
            session_id: self.session_id.clone(),
            received_at_ms: stamp,
            raw: None,
            msg: StreamEventMsg::Unknown(UnknownEvent {
                raw: raw.to_string(),
            }),
        }
    }

    /// Wall-clock milliseconds, clamped so stamps never move backwards
    /// within one parser.
    pub(crate) fn next_stamp(&mut self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(self.last_stamp_ms);
        self.last_stamp_ms = now.max(self.last_stamp_ms);
        self.last_stamp_ms
    }
}

fn record_uuid(value: &Value) -> String {
    value
        .get("uuid")
        .and_then(Value::as_str)
        .or_else(|| {
            value
                .get("message")
                .and_then(|m| m.get("id"))
                .and_then(Value::as_str)
        })
        .unwrap_or_default()
        .to_string()
}

fn parse_assistant(value: &Value) -> Vec<StreamEventMsg> {
    let uuid = record_uuid(value);
    let content = value.get("message").and_then(|m| m.get("content"));

    // Walk the content blocks in record order, coalescing adjacent text
    // blocks into one run, so the emitted events keep the record's order.
    enum Part<'a> {
        Text(String),
        ToolUse(&'a Value),
    }

    let mut parts: Vec<Part> = Vec::new();
    match content {
        Some(Value::String(text)) => parts.push(Part::Text(text.clone())),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            if let Some(Part::Text(run)) = parts.last_mut() {
                                run.push_str(text);
                            } else {
                                parts.push(Part::Text(text.to_string()));
                            }
                        }
                    }
                    Some("tool_use") => parts.push(Part::ToolUse(block)),
                    // Thinking blocks stream separately as deltas; the
                    // consolidated record adds nothing for subscribers.
                    _ => {}
                }
            }
        }
        _ => {}
    }

    if parts.is_empty() {
        return vec![StreamEventMsg::AssistantText(AssistantTextEvent {
            uuid,
            text: String::new(),
        })];
    }

    let split = parts.len() > 1;
    let mut tool_index = 0usize;
    let mut text_segment = 0usize;
    parts
        .into_iter()
        .map(|part| match part {
            Part::Text(text) => {
                let event_uuid = if text_segment == 0 {
                    uuid.clone()
                } else {
                    format!("{uuid}_text_{text_segment}")
                };
                text_segment += 1;
                StreamEventMsg::AssistantText(AssistantTextEvent {
                    uuid: event_uuid,
                    text,
                })
            }
            Part::ToolUse(block) => {
                let event_uuid = if split {
                    format!("{uuid}_tool_{tool_index}")
                } else {
                    uuid.clone()
                };
                let msg = StreamEventMsg::AssistantToolUse(AssistantToolUseEvent {
                    uuid: event_uuid,
                    tool_use_id: block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    tool_name: block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    input: block.get("input").cloned().unwrap_or(Value::Null),
                    block_index: tool_index,
                });
                tool_index += 1;
                msg
            }
        })
        .collect()
}

fn parse_user(value: &Value) -> Vec<StreamEventMsg> {
    let uuid = record_uuid(value);
    let content = value.get("message").and_then(|m| m.get("content"));

    match content {
        Some(Value::String(text)) => vec![StreamEventMsg::UserToolResult(UserToolResultEvent {
            uuid,
            tool_use_id: None,
            content: text.clone(),
            is_error: false,
        })],
        Some(Value::Array(blocks)) => {
            let results: Vec<&Value> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_result"))
                .collect();
            if results.is_empty() {
                let text = blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("");
                return vec![StreamEventMsg::UserToolResult(UserToolResultEvent {
                    uuid,
                    tool_use_id: None,
                    content: text,
                    is_error: false,
                })];
            }
            let split = results.len() > 1;
            results
                .iter()
                .enumerate()
                .map(|(index, block)| {
                    let event_uuid = if split {
                        format!("{uuid}_tool_{index}")
                    } else {
                        uuid.clone()
                    };
                    StreamEventMsg::UserToolResult(UserToolResultEvent {
                        uuid: event_uuid,
                        tool_use_id: block
                            .get("tool_use_id")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        content: stringify_tool_content(block.get("content")),
                        is_error: block
                            .get("is_error")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                    })
                })
                .collect()
        }
        _ => vec![StreamEventMsg::UserToolResult(UserToolResultEvent {
            uuid,
            tool_use_id: None,
            content: String::new(),
            is_error: false,
        })],
    }
}

fn parse_tool_result_record(value: &Value) -> StreamEventMsg {
    StreamEventMsg::UserToolResult(UserToolResultEvent {
        uuid: record_uuid(value),
        tool_use_id: value
            .get("tool_use_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        content: stringify_tool_content(value.get("content")),
        is_error: value
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

fn stringify_tool_content(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn parse_result(value: &Value, subtype: Option<&str>) -> TurnResultEvent {
    TurnResultEvent {
        subtype: subtype.unwrap_or("ok").to_string(),
        num_turns: value.get("num_turns").and_then(Value::as_i64),
        duration_ms: value.get("duration_ms").and_then(Value::as_i64),
        total_cost_usd: value.get("total_cost_usd").and_then(Value::as_f64),
        usage: value.get("usage").cloned(),
        is_error: value.get("is_error").and_then(Value::as_bool).unwrap_or(false),
    }
}

fn parse_compact_boundary(value: &Value) -> CompactBoundaryEvent {
    let meta = value.get("compact_metadata").unwrap_or(value);
    CompactBoundaryEvent {
        trigger: meta
            .get("trigger")
            .and_then(Value::as_str)
            .map(str::to_string),
        pre_tokens: meta.get("pre_tokens").and_then(Value::as_u64),
    }
}
