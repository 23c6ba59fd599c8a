use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures_util::Stream;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::error::BridgeError;
use crate::protocol::{self, Message, RequestKind, RequestMode};

use super::middleware::AuthIdentity;
use super::pending::{Outcome, OutcomeSink, StreamEvent};
use super::registry::WorkerHandle;
use super::EdgeState;

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    timestamp: u64,
}

/// Health check handler.
pub async fn health() -> impl IntoResponse {
    Json(HealthBody {
        status: "ok",
        timestamp: protocol::now_ms(),
    })
}

/// `POST /v1/chat/completions` — unary, or SSE when the body asks to stream.
pub async fn chat_completions(
    State(state): State<Arc<EdgeState>>,
    Extension(identity): Extension<AuthIdentity>,
    body: Bytes,
) -> Response {
    relay_completionish(state, identity, body, RequestKind::Chat).await
}

/// `POST /v1/completions` — unary, or SSE when the body asks to stream.
pub async fn completions(
    State(state): State<Arc<EdgeState>>,
    Extension(identity): Extension<AuthIdentity>,
    body: Bytes,
) -> Response {
    relay_completionish(state, identity, body, RequestKind::Completion).await
}

/// `POST /v1/embeddings` — always unary.
pub async fn embeddings(
    State(state): State<Arc<EdgeState>>,
    Extension(identity): Extension<AuthIdentity>,
    body: Bytes,
) -> Response {
    if let Some(resp) = check_rate_limit(&state, &identity) {
        return resp;
    }
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };

    let Some(worker) = state.registry.pick_available(None) else {
        return BridgeError::NoWorker.into_response();
    };

    let request_id = Uuid::new_v4().to_string();
    let msg = Message::EmbeddingsRequest {
        request_id: request_id.clone(),
        data: payload,
    };
    relay_unary(state, worker, RequestKind::Embeddings, request_id, msg).await
}

/// `GET /v1/models` — served from the 60 s cache when fresh.
pub async fn models(
    State(state): State<Arc<EdgeState>>,
    Extension(identity): Extension<AuthIdentity>,
) -> Response {
    if let Some(resp) = check_rate_limit(&state, &identity) {
        return resp;
    }

    if let Some(payload) = state.models_cache.get() {
        return Json(payload).into_response();
    }

    let Some(worker) = state.registry.pick_available(None) else {
        return models_unavailable();
    };

    let request_id = Uuid::new_v4().to_string();
    let (tx, rx) = oneshot::channel();
    state.pending.register(
        &request_id,
        RequestKind::Models,
        RequestMode::Unary,
        worker.conn_id(),
        OutcomeSink::Unary(tx),
        state.config.deadline_for(RequestKind::Models, RequestMode::Unary),
    );

    let msg = Message::ModelsRequest {
        request_id: request_id.clone(),
    };
    if worker.send_message(msg).is_err() {
        state.pending.cancel_by_client(&request_id);
        return models_unavailable();
    }

    let _guard = CancelGuard::new(state.clone(), request_id, worker);
    match rx.await {
        Ok(Outcome::Success(payload)) => {
            state.models_cache.fill(payload.clone());
            Json(payload).into_response()
        }
        Ok(Outcome::Failure(BridgeError::NoWorker))
        | Ok(Outcome::Failure(BridgeError::WorkerGone)) => models_unavailable(),
        Ok(Outcome::Failure(e)) => e.into_response(),
        Err(_) => BridgeError::Internal("request dropped".into()).into_response(),
    }
}

/// Shared path for chat and completion requests, which differ only in the
/// frames they use and may stream.
async fn relay_completionish(
    state: Arc<EdgeState>,
    identity: AuthIdentity,
    body: Bytes,
    kind: RequestKind,
) -> Response {
    if let Some(resp) = check_rate_limit(&state, &identity) {
        return resp;
    }
    let mut payload = match parse_body(&body) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };

    let mut stream = payload
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if stream && !state.config.enable_streaming {
        // Streaming disabled: handle unary, transparently to the client.
        payload["stream"] = Value::Bool(false);
        stream = false;
    }

    let Some(worker) = state.registry.pick_available(None) else {
        return BridgeError::NoWorker.into_response();
    };

    let request_id = Uuid::new_v4().to_string();
    let msg = match kind {
        RequestKind::Chat => Message::ChatRequest {
            request_id: request_id.clone(),
            stream,
            data: payload,
        },
        _ => Message::CompletionRequest {
            request_id: request_id.clone(),
            stream,
            data: payload,
        },
    };

    if stream {
        relay_stream(state, worker, kind, request_id, msg)
    } else {
        relay_unary(state, worker, kind, request_id, msg).await
    }
}

/// Dispatch a unary request and await its single outcome.
async fn relay_unary(
    state: Arc<EdgeState>,
    worker: Arc<WorkerHandle>,
    kind: RequestKind,
    request_id: String,
    msg: Message,
) -> Response {
    let (tx, rx) = oneshot::channel();
    state.pending.register(
        &request_id,
        kind,
        RequestMode::Unary,
        worker.conn_id(),
        OutcomeSink::Unary(tx),
        state.config.deadline_for(kind, RequestMode::Unary),
    );

    if worker.send_message(msg).is_err() {
        state.pending.cancel_by_client(&request_id);
        return BridgeError::NoWorker.into_response();
    }

    // If the client goes away while we wait, the guard cancels the entry
    // and tells the worker to stop.
    let _guard = CancelGuard::new(state.clone(), request_id, worker);
    match rx.await {
        Ok(Outcome::Success(payload)) => Json(payload).into_response(),
        Ok(Outcome::Failure(e)) => e.into_response(),
        Err(_) => BridgeError::Internal("request dropped".into()).into_response(),
    }
}

/// Dispatch a streaming request and bridge its chunk sequence onto an SSE
/// response body.
fn relay_stream(
    state: Arc<EdgeState>,
    worker: Arc<WorkerHandle>,
    kind: RequestKind,
    request_id: String,
    msg: Message,
) -> Response {
    let (tx, rx) = mpsc::unbounded_channel();
    state.pending.register(
        &request_id,
        kind,
        RequestMode::Stream,
        worker.conn_id(),
        OutcomeSink::Stream(tx),
        state.config.deadline_for(kind, RequestMode::Stream),
    );

    if worker.send_message(msg).is_err() {
        state.pending.cancel_by_client(&request_id);
        return BridgeError::NoWorker.into_response();
    }

    let guard = CancelGuard::new(state, request_id, worker);
    let bridge = SseBridge::new(rx, guard);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(bridge))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Turns the pending table's stream events into SSE frames, in receipt
/// order. Dropping the bridge before the terminal event (the client went
/// away) fires the cancel guard.
struct SseBridge {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    _guard: CancelGuard,
    done: bool,
}

impl SseBridge {
    fn new(rx: mpsc::UnboundedReceiver<StreamEvent>, guard: CancelGuard) -> Self {
        Self {
            rx,
            _guard: guard,
            done: false,
        }
    }
}

impl Stream for SseBridge {
    type Item = Result<Bytes, std::convert::Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(StreamEvent::Chunk(data))) => {
                Poll::Ready(Some(Ok(Bytes::from(format!("data: {data}\n\n")))))
            }
            Poll::Ready(Some(StreamEvent::End)) => {
                this.done = true;
                Poll::Ready(Some(Ok(Bytes::from_static(b"data: [DONE]\n\n"))))
            }
            Poll::Ready(Some(StreamEvent::Error(e))) => {
                this.done = true;
                Poll::Ready(Some(Ok(Bytes::from(format!("data: [ERROR] {e}\n\n")))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// On drop, removes the pending entry and tells the worker to cancel —
/// unless the entry already reached a terminal outcome, in which case both
/// are no-ops.
struct CancelGuard {
    state: Arc<EdgeState>,
    request_id: String,
    worker: Arc<WorkerHandle>,
}

impl CancelGuard {
    fn new(state: Arc<EdgeState>, request_id: String, worker: Arc<WorkerHandle>) -> Self {
        Self {
            state,
            request_id,
            worker,
        }
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.state.pending.cancel_by_client(&self.request_id) {
            debug!(
                request_id = self.request_id,
                "client disconnected, cancelling request"
            );
            let _ = self.worker.send_message(Message::CancelRequest {
                request_id: self.request_id.clone(),
            });
        }
    }
}

fn parse_body(body: &Bytes) -> Result<Value, BridgeError> {
    serde_json::from_slice(body).map_err(|e| BridgeError::BadRequest(format!("invalid JSON body: {e}")))
}

fn check_rate_limit(state: &EdgeState, identity: &AuthIdentity) -> Option<Response> {
    let limiter = state.rate_limiter.as_ref()?;
    if limiter.allow(identity.bucket_id()) {
        None
    } else {
        let body = json!({
            "error": {
                "message": "rate limit exceeded",
                "type": "api_error",
                "code": 429,
            }
        });
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        response
            .headers_mut()
            .insert("Retry-After", "60".parse().unwrap());
        Some(response)
    }
}

/// The models endpoint's 503 keeps the OpenAI list shape.
fn models_unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "object": "list",
            "data": [],
            "message": "No LM Studio clients connected",
        })),
    )
        .into_response()
}
