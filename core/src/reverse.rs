//! Reverse calls: RPC invocations originated by the gateway and answered by
//! the client, correlated by call id with a timeout.
//!
//! Completion is exactly-once per call id: a call either resolves with the
//! client's reply, fails with `ReverseCallTimeout`, or fails with
//! `SessionClosed` when the owning session drains. Late replies are dropped
//! with a warning.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

use gateway_protocol::rpc::CallId;
use gateway_protocol::rpc::ResponseEnvelope;
use gateway_protocol::rpc::ServerNotification;
use gateway_protocol::rpc::ServerRequest;

use crate::error::GatewayErr;
use crate::error::Result;

/// Cap on outstanding reverse calls per session.
const MAX_PENDING_CALLS: usize = 10_000;

/// The transport-facing half the gateway needs for server-initiated
/// traffic. Implemented by the WebSocket connection; tests supply fakes.
#[async_trait]
pub trait ClientChannel: Send + Sync + 'static {
    /// Emit a `client.call` frame carrying `call_id` and the request.
    async fn send_reverse_call(&self, call_id: CallId, request: ServerRequest) -> Result<()>;

    /// Emit a fire-and-forget `client.call` frame with no call id.
    async fn send_notification(&self, notification: ServerNotification) -> Result<()>;
}

type Completer = oneshot::Sender<Result<Value>>;

/// Call ids come from one process-wide counter so an id identifies its
/// session unambiguously even when several sessions share a connection.
static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(0);

/// Pending reverse calls of one session.
#[derive(Default)]
pub struct PendingCalls {
    completers: Mutex<HashMap<CallId, Completer>>,
}

impl PendingCalls {
    /// Allocate a call id (unique within the session, never reused) and
    /// register its completer.
    pub async fn register(&self) -> Result<(CallId, oneshot::Receiver<Result<Value>>)> {
        let mut completers = self.completers.lock().await;
        if completers.len() >= MAX_PENDING_CALLS {
            return Err(GatewayErr::Overloaded);
        }
        let id = NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        completers.insert(id, tx);
        Ok((id, rx))
    }

    /// Route a reply to its completer if this session owns the call id.
    /// Returns false when the id is unknown here (wrong session or already
    /// expired).
    pub async fn try_complete(&self, call_id: CallId, reply: ResponseEnvelope) -> bool {
        let completer = self.completers.lock().await.remove(&call_id);
        let Some(completer) = completer else {
            return false;
        };
        let outcome = if reply.success {
            Ok(reply.result.unwrap_or(Value::Null))
        } else {
            let error = reply
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "client reported failure".to_string());
            Err(GatewayErr::BadPayload(error))
        };
        if completer.send(outcome).is_err() {
            warn!(call_id, "reverse-call awaiter went away before completion");
        }
        true
    }

    /// Route a `client.reply` to its completer. Unknown or expired ids are
    /// dropped with a warning.
    pub async fn complete(&self, call_id: CallId, reply: ResponseEnvelope) {
        if !self.try_complete(call_id, reply).await {
            warn!(call_id, "dropping reply to unknown or expired reverse call");
        }
    }

    async fn remove(&self, call_id: CallId) {
        self.completers.lock().await.remove(&call_id);
    }

    /// Fail every outstanding call; used when the session closes.
    pub async fn drain_with_session_closed(&self) {
        let completers: Vec<(CallId, Completer)> =
            self.completers.lock().await.drain().collect();
        for (call_id, completer) in completers {
            if completer.send(Err(GatewayErr::SessionClosed)).is_err() {
                warn!(call_id, "pending reverse call had no awaiter at drain");
            }
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.completers.lock().await.len()
    }
}

/// Issue one reverse call over `channel` and await the reply.
///
/// On timeout the completer entry is removed so a late reply is dropped
/// rather than delivered; the session itself is unaffected.
pub async fn call(
    channel: &dyn ClientChannel,
    pending: &PendingCalls,
    request: ServerRequest,
    timeout: Duration,
) -> Result<Value> {
    let (call_id, rx) = pending.register().await?;
    channel.send_reverse_call(call_id, request).await?;

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_recv_gone)) => Err(GatewayErr::SessionClosed),
        Err(_elapsed) => {
            pending.remove(call_id).await;
            Err(GatewayErr::ReverseCallTimeout(timeout))
        }
    }
}
