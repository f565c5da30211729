//! Sends frames to one connected client.
//!
//! All server-originated traffic funnels through [`OutgoingMessageSender`]:
//! request/response completions, stream items, reverse calls and
//! fire-and-forget notifications. The sender only builds frames; a writer
//! task owns the socket and performs the actual I/O.

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use gateway_protocol::frame::Frame;
use gateway_protocol::frame::routes;
use gateway_protocol::rpc::CallId;
use gateway_protocol::rpc::ResponseEnvelope;
use gateway_protocol::rpc::RpcError;
use gateway_protocol::rpc::ServerNotification;
use gateway_protocol::rpc::ServerRequest;
use gateway_protocol::rpc::StreamFrame;

pub struct OutgoingMessageSender {
    tx: mpsc::UnboundedSender<Frame>,
}

impl OutgoingMessageSender {
    pub fn new(tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self { tx }
    }

    /// Complete a request/response method, or fail-fast a stream request.
    pub fn send_response(&self, call_id: CallId, envelope: &ResponseEnvelope) {
        self.send_json(routes::AGENT_RESPONSE, Some(call_id), envelope);
    }

    pub fn send_error(&self, call_id: CallId, error: RpcError) {
        self.send_response(call_id, &ResponseEnvelope::err(error));
    }

    /// One stream item or terminal marker, correlated with the request.
    pub fn send_stream_item(&self, call_id: CallId, item: &StreamFrame) {
        self.send_json(routes::AGENT_STREAM, Some(call_id), item);
    }

    /// Reverse call; the reply comes back on `client.reply` with the same
    /// call id.
    pub fn send_reverse_call(&self, call_id: CallId, request: &ServerRequest) {
        self.send_json(routes::CLIENT_CALL, Some(call_id), request);
    }

    /// Fire-and-forget push; no call id, no reply.
    pub fn send_notification(&self, notification: &ServerNotification) {
        self.send_json(routes::CLIENT_CALL, None, notification);
    }

    fn send_json<T: serde::Serialize>(&self, route: &str, call_id: Option<CallId>, payload: &T) {
        let payload = match serde_json::to_vec(payload) {
            Ok(payload) => payload,
            Err(err) => {
                // A payload we built ourselves failing to serialize is a bug.
                warn!(route, "dropping unserializable frame: {err}");
                match serde_json::to_vec(&fallback_error()) {
                    Ok(fallback) => fallback,
                    Err(_) => return,
                }
            }
        };
        let frame = Frame::new(route, call_id, Bytes::from(payload));
        if self.tx.send(frame).is_err() {
            // Writer gone: the connection is closing; drops are expected.
        }
    }
}

fn fallback_error() -> Value {
    serde_json::json!({
        "success": false,
        "error": { "code": "internal", "message": "internal error" },
    })
}
