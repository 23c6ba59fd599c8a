use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::protocol::{self, Message};

use super::registry::{OutboundFrame, WorkerHandle};
use super::EdgeState;

/// How long a new connection gets to present its `auth` frame.
const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Close code for authentication failures.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// WebSocket endpoint handler for worker connections.
pub async fn ws_handler(
    State(state): State<Arc<EdgeState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle an individual worker connection: auth gate first, then the
/// serving loop. A connection that fails the gate never reaches the
/// message dispatcher.
async fn handle_socket(socket: WebSocket, state: Arc<EdgeState>) {
    let (mut sender, mut receiver) = socket.split();

    let client_id = match auth_gate(&state, &mut sender, &mut receiver).await {
        Some(id) => id,
        None => return,
    };

    let token = match state.signer.issue(&client_id) {
        Ok(token) => token,
        Err(e) => {
            warn!(client_id, error = %e, "failed to sign worker token");
            let _ = close_with(&mut sender, CLOSE_POLICY_VIOLATION, "Authentication failed").await;
            return;
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let handle = WorkerHandle::new(client_id.clone(), tx);
    state.registry.add(handle.clone());

    if send_message(
        &mut sender,
        &Message::AuthResult {
            success: true,
            token: Some(token),
            error: None,
        },
    )
    .await
    .is_err()
    {
        state.registry.remove(&handle);
        return;
    }

    info!(client_id, "worker authenticated");

    socket_loop(&state, &handle, &mut sender, &mut receiver, rx).await;

    // Cleanup: the registry drops this connection (unless a replacement
    // already took the slot) and every request it owned fails now, not at
    // its deadline.
    handle.mark_closed();
    state.registry.remove(&handle);
    state.pending.fail_worker(handle.conn_id());
    info!(client_id, "worker disconnected");
}

/// Enforce that the first protocol frame is a valid `auth`. Returns the
/// client id on success; on any failure the transport is closed with 1008
/// and `None` is returned.
async fn auth_gate(
    state: &EdgeState,
    sender: &mut SplitSink<WebSocket, WsMessage>,
    receiver: &mut SplitStream<WebSocket>,
) -> Option<String> {
    let first = tokio::time::timeout(AUTH_TIMEOUT, async {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => return Some(text),
                // Control frames are not protocol messages
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => continue,
                Ok(WsMessage::Close(_)) | Err(_) => return None,
                Ok(_) => return None,
            }
        }
        None
    })
    .await;

    let text = match first {
        Ok(Some(text)) => text,
        Ok(None) => return None,
        Err(_) => {
            warn!("worker sent no auth frame before timeout");
            let _ = close_with(sender, CLOSE_POLICY_VIOLATION, "Authentication failed").await;
            return None;
        }
    };

    let (api_key, client_id) = match protocol::decode(&text) {
        Ok(Message::Auth { api_key, client_id }) => (api_key, client_id),
        _ => {
            let _ = send_message(
                sender,
                &Message::Error {
                    request_id: None,
                    error: "Authentication required".into(),
                },
            )
            .await;
            let _ = close_with(sender, CLOSE_POLICY_VIOLATION, "Authentication failed").await;
            return None;
        }
    };

    if api_key.as_deref() != Some(state.api_key.as_str()) {
        warn!("worker auth failed: bad api key");
        let _ = send_message(
            sender,
            &Message::AuthResult {
                success: false,
                token: None,
                error: Some("Invalid API key".into()),
            },
        )
        .await;
        let _ = close_with(sender, CLOSE_POLICY_VIOLATION, "Authentication failed").await;
        return None;
    }

    match client_id.filter(|id| !id.trim().is_empty()) {
        Some(id) => Some(id),
        None => {
            warn!("worker auth failed: missing client id");
            let _ = send_message(
                sender,
                &Message::AuthResult {
                    success: false,
                    token: None,
                    error: Some("Client ID required".into()),
                },
            )
            .await;
            let _ = close_with(sender, CLOSE_POLICY_VIOLATION, "Authentication failed").await;
            None
        }
    }
}

/// Main serving loop: drain the outbound frame channel into the socket and
/// dispatch inbound frames. Exits on transport close, write failure, or a
/// Terminate/Close frame from the supervisor or registry.
async fn socket_loop(
    state: &Arc<EdgeState>,
    handle: &Arc<WorkerHandle>,
    sender: &mut SplitSink<WebSocket, WsMessage>,
    receiver: &mut SplitStream<WebSocket>,
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
) {
    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(OutboundFrame::Message(msg)) => {
                    if send_message(sender, &msg).await.is_err() {
                        break;
                    }
                }
                Some(OutboundFrame::Ping) => {
                    if sender.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                Some(OutboundFrame::Close { code, reason }) => {
                    let _ = close_with(sender, code, reason).await;
                    break;
                }
                Some(OutboundFrame::Terminate) | None => break,
            },

            inbound = receiver.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    dispatch_frame(state, handle, &text);
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    if sender.send(WsMessage::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    handle.mark_alive();
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(client_id = handle.client_id(), error = %e, "websocket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Route one inbound frame. Responses are matched to pending entries by
/// request id; protocol errors go back to the worker as `error` frames.
fn dispatch_frame(state: &Arc<EdgeState>, handle: &Arc<WorkerHandle>, text: &str) {
    let msg = match protocol::decode(text) {
        Ok(msg) => msg,
        Err(e @ protocol::DecodeError::UnknownTag(_))
        | Err(e @ protocol::DecodeError::MissingType) => {
            let _ = handle.send_message(Message::Error {
                request_id: None,
                error: e.to_string(),
            });
            return;
        }
        Err(protocol::DecodeError::Malformed(e)) => {
            warn!(client_id = handle.client_id(), error = %e, "dropping malformed frame");
            return;
        }
    };

    match msg {
        Message::Ping { .. } => {
            let _ = handle.send_message(Message::Pong {
                timestamp: Some(protocol::now_ms()),
            });
        }
        Message::Pong { .. } => {}

        Message::ChatResponse { request_id, data }
        | Message::CompletionResponse { request_id, data }
        | Message::EmbeddingsResponse { request_id, data }
        | Message::ModelsResponse { request_id, data } => {
            state.pending.resolve(&request_id, data);
        }

        Message::StreamChunk { request_id, data } => {
            state.pending.feed_chunk(&request_id, data);
        }
        Message::StreamEnd { request_id } => {
            state.pending.finish_stream(&request_id);
        }

        Message::Error { request_id, error } | Message::ErrorResponse { request_id, error } => {
            match request_id {
                Some(id) => state.pending.fail(&id, BridgeError::Upstream(error)),
                None => {
                    warn!(client_id = handle.client_id(), error, "worker error without request id")
                }
            }
        }

        Message::Auth { .. } => {
            warn!(client_id = handle.client_id(), "duplicate auth frame ignored");
        }

        other => {
            debug!(
                client_id = handle.client_id(),
                frame = ?other,
                "unexpected frame from worker ignored"
            );
        }
    }
}

/// Periodic liveness sweep over all registered workers. A worker that has
/// not ponged since the previous sweep is terminated abruptly; everyone
/// else gets `alive` cleared and a fresh control ping.
pub fn spawn_liveness_supervisor(state: Arc<EdgeState>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick would terminate workers that have not
        // had a chance to pong yet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for worker in state.registry.handles() {
                if !worker.is_alive() {
                    warn!(
                        client_id = worker.client_id(),
                        "worker missed ping, terminating"
                    );
                    let _ = worker.send(OutboundFrame::Terminate);
                } else {
                    worker.clear_alive();
                    let _ = worker.send(OutboundFrame::Ping);
                }
            }
        }
    })
}

async fn send_message(
    sender: &mut SplitSink<WebSocket, WsMessage>,
    msg: &Message,
) -> Result<(), axum::Error> {
    sender
        .send(WsMessage::Text(protocol::encode(msg).into()))
        .await
}

async fn close_with(
    sender: &mut SplitSink<WebSocket, WsMessage>,
    code: u16,
    reason: &'static str,
) -> Result<(), axum::Error> {
    sender
        .send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await
}
