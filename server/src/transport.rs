//! WebSocket transport: one persistent duplex byte stream per client.
//!
//! Clients upgrade on `GET /gateway/v1/ws` and exchange binary frames.
//! The connection task splits into a reader (decode + dispatch) and a
//! writer (encode + send); a ping keeps idle connections alive and a
//! silence deadline reaps dead ones. Connection close cascades into
//! session cleanup through the orchestrator.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::WebSocketUpgrade;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::response::Response;
use axum::routing::get;
use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::warn;

use uuid::Uuid;

use gateway_core::Orchestrator;
use gateway_protocol::frame::Frame;

use crate::message_processor::MessageProcessor;
use crate::outgoing_message::OutgoingMessageSender;

/// Upgrade path clients connect to.
pub const WS_PATH: &str = "/gateway/v1/ws";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route(WS_PATH, get(ws_upgrade))
        .with_state(AppState { orchestrator })
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state.orchestrator, socket))
}

async fn handle_socket(orchestrator: Arc<Orchestrator>, socket: WebSocket) {
    let client_id = Uuid::new_v4();
    info!(%client_id, "client connected");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let outgoing = Arc::new(OutgoingMessageSender::new(out_tx));
    let processor = MessageProcessor::new(client_id, orchestrator.clone(), outgoing);

    let keep_alive_interval = orchestrator.config().keep_alive_interval;
    let keep_alive_timeout = orchestrator.config().keep_alive_timeout;

    let (mut sink, mut stream) = socket.split();

    let mut ping = tokio::time::interval(keep_alive_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_heard = Instant::now();

    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                match frame.encode() {
                    Ok(encoded) => {
                        if sink.send(Message::Binary(encoded)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(%client_id, "dropping unencodable frame: {err}"),
                }
            }
            message = stream.next() => {
                let Some(Ok(message)) = message else { break };
                last_heard = Instant::now();
                match message {
                    Message::Binary(data) => match Frame::decode(&data) {
                        Ok(frame) => processor.process_frame(frame).await,
                        Err(err) => warn!(%client_id, "undecodable frame: {err}"),
                    },
                    Message::Ping(payload) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => break,
                    Message::Text(_) => {
                        debug!(%client_id, "ignoring text frame on binary transport");
                    }
                }
            }
            _ = ping.tick() => {
                if last_heard.elapsed() > keep_alive_timeout {
                    warn!(%client_id, "keep-alive timeout; dropping connection");
                    break;
                }
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    // The transport owns its clients: a gone client means its sessions
    // terminate, in-flight streams included.
    orchestrator.on_client_disconnect(client_id).await;
    info!(%client_id, "client disconnected");
}
