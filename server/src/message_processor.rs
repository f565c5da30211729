//! Decodes inbound frames and dispatches them to the orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

use uuid::Uuid;

use gateway_core::GatewayErr;
use gateway_core::Orchestrator;
use gateway_core::Subscriber;
use gateway_core::reverse::ClientChannel;
use gateway_core::session::SUBSCRIBER_QUEUE_CAPACITY;
use gateway_protocol::frame::Frame;
use gateway_protocol::frame::routes;
use gateway_protocol::rpc::CallId;
use gateway_protocol::rpc::ClientRequest;
use gateway_protocol::rpc::RequestParseError;
use gateway_protocol::rpc::ResponseEnvelope;
use gateway_protocol::rpc::RpcError;
use gateway_protocol::rpc::ServerNotification;
use gateway_protocol::rpc::ServerRequest;
use gateway_protocol::rpc::StreamFrame;

use crate::outgoing_message::OutgoingMessageSender;

/// Per-connection processor. One exists per WebSocket client; the client id
/// scopes session ownership and cleanup.
pub struct MessageProcessor {
    client_id: Uuid,
    orchestrator: Arc<Orchestrator>,
    outgoing: Arc<OutgoingMessageSender>,
    channel: Arc<dyn ClientChannel>,
}

/// [`ClientChannel`] backed by the connection's outgoing sender, used by
/// the orchestrator for reverse calls and pushes.
pub struct WsClientChannel {
    outgoing: Arc<OutgoingMessageSender>,
}

#[async_trait]
impl ClientChannel for WsClientChannel {
    async fn send_reverse_call(
        &self,
        call_id: CallId,
        request: ServerRequest,
    ) -> gateway_core::Result<()> {
        self.outgoing.send_reverse_call(call_id, &request);
        Ok(())
    }

    async fn send_notification(
        &self,
        notification: ServerNotification,
    ) -> gateway_core::Result<()> {
        self.outgoing.send_notification(&notification);
        Ok(())
    }
}

impl MessageProcessor {
    pub fn new(
        client_id: Uuid,
        orchestrator: Arc<Orchestrator>,
        outgoing: Arc<OutgoingMessageSender>,
    ) -> Self {
        let channel = Arc::new(WsClientChannel {
            outgoing: outgoing.clone(),
        });
        Self {
            client_id,
            orchestrator,
            outgoing,
            channel,
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub async fn process_frame(&self, frame: Frame) {
        if frame.route == routes::CLIENT_REPLY {
            self.process_reply(frame).await;
            return;
        }

        let Some(method) = routes::agent_method(&frame.route) else {
            self.reject_route(&frame);
            return;
        };
        // `agent.response` / `agent.stream` only ever flow server → client.
        if frame.route == routes::AGENT_RESPONSE || frame.route == routes::AGENT_STREAM {
            self.reject_route(&frame);
            return;
        }

        let Some(call_id) = frame.call_id else {
            warn!(route = %frame.route, "request frame without call id; dropping");
            return;
        };

        let request = match ClientRequest::parse(method, &frame.payload) {
            Ok(request) => request,
            Err(RequestParseError::UnknownRoute(route)) => {
                self.outgoing
                    .send_error(call_id, GatewayErr::UnknownRoute(route).to_rpc_error());
                return;
            }
            Err(err @ RequestParseError::BadPayload { .. }) => {
                self.outgoing.send_error(
                    call_id,
                    GatewayErr::BadPayload(err.to_string()).to_rpc_error(),
                );
                return;
            }
        };

        debug!(client = %self.client_id, method = request.method(), call_id, "-> request");
        self.dispatch(call_id, request).await;
    }

    async fn process_reply(&self, frame: Frame) {
        let Some(call_id) = frame.call_id else {
            warn!("client.reply without call id; dropping");
            return;
        };
        match serde_json::from_slice::<ResponseEnvelope>(&frame.payload) {
            Ok(reply) => {
                self.orchestrator.complete_reverse_call(call_id, reply).await;
            }
            Err(err) => warn!(call_id, "malformed client.reply payload: {err}"),
        }
    }

    fn reject_route(&self, frame: &Frame) {
        let error = GatewayErr::UnknownRoute(frame.route.clone()).to_rpc_error();
        match frame.call_id {
            Some(call_id) => self.outgoing.send_error(call_id, error),
            None => warn!(route = %frame.route, "unroutable frame without call id"),
        }
    }

    async fn dispatch(&self, call_id: CallId, request: ClientRequest) {
        match request {
            ClientRequest::Connect(params) => {
                let result = self
                    .orchestrator
                    .connect(self.client_id, self.channel.clone(), params)
                    .await;
                self.respond(call_id, result);
            }
            ClientRequest::Query(params) => {
                let (subscriber, rx) = self.stream_subscriber(call_id);
                if let Err(err) = self.orchestrator.query(params, subscriber).await {
                    self.outgoing.send_error(call_id, err.to_rpc_error());
                } else {
                    self.pump_stream(call_id, rx);
                }
            }
            ClientRequest::QueryWithContent(params) => {
                let (subscriber, rx) = self.stream_subscriber(call_id);
                if let Err(err) = self.orchestrator.query_with_content(params, subscriber).await {
                    self.outgoing.send_error(call_id, err.to_rpc_error());
                } else {
                    self.pump_stream(call_id, rx);
                }
            }
            ClientRequest::Interrupt(params) => {
                self.respond(call_id, self.orchestrator.interrupt(params).await);
            }
            ClientRequest::RunInBackground(params) => {
                self.respond(call_id, self.orchestrator.run_in_background(params).await);
            }
            ClientRequest::SetModel(params) => {
                self.respond(call_id, self.orchestrator.set_model(params).await);
            }
            ClientRequest::SetPermissionMode(params) => {
                self.respond(call_id, self.orchestrator.set_permission_mode(params).await);
            }
            ClientRequest::SetMaxThinkingTokens(params) => {
                self.respond(
                    call_id,
                    self.orchestrator.set_max_thinking_tokens(params).await,
                );
            }
            ClientRequest::Disconnect(params) => {
                self.respond(call_id, self.orchestrator.disconnect(params).await);
            }
            ClientRequest::GetHistory(params) => {
                self.respond(call_id, self.orchestrator.get_history(params).await);
            }
            ClientRequest::LoadHistory(params) => {
                self.respond(call_id, self.orchestrator.load_history(params).await);
            }
            ClientRequest::GetHistoryMetadata(params) => {
                self.respond(call_id, self.orchestrator.get_history_metadata(params).await);
            }
            ClientRequest::GetHistorySessions(params) => {
                self.respond(call_id, self.orchestrator.get_history_sessions(params).await);
            }
            ClientRequest::TruncateHistory(params) => {
                self.respond(call_id, self.orchestrator.truncate_history(params).await);
            }
            ClientRequest::ListSessions(_params) => {
                self.respond(call_id, self.orchestrator.list_sessions().await);
            }
        }
    }

    fn respond<T: Serialize>(&self, call_id: CallId, result: gateway_core::Result<T>) {
        match result {
            Ok(value) => match ResponseEnvelope::ok(&value) {
                Ok(envelope) => self.outgoing.send_response(call_id, &envelope),
                Err(err) => {
                    warn!(call_id, "failed to serialize response: {err}");
                    self.outgoing
                        .send_error(call_id, RpcError::new("internal", "internal error"));
                }
            },
            Err(err) => self.outgoing.send_error(call_id, err.to_rpc_error()),
        }
    }

    fn stream_subscriber(&self, call_id: CallId) -> (Subscriber, mpsc::Receiver<StreamFrame>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        (Subscriber { call_id, tx }, rx)
    }

    /// Forward stream items until the terminal frame.
    fn pump_stream(&self, call_id: CallId, mut rx: mpsc::Receiver<StreamFrame>) {
        let outgoing = self.outgoing.clone();
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                let terminal = matches!(
                    item,
                    StreamFrame::Completed { .. } | StreamFrame::Failed { .. }
                );
                outgoing.send_stream_item(call_id, &item);
                if terminal {
                    break;
                }
            }
        });
    }
}
