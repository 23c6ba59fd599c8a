use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;

use crate::protocol;

use super::connection::WorkerStatus;

#[derive(Debug, Serialize)]
struct WorkerHealth {
    status: &'static str,
    connected: bool,
    authenticated: bool,
    timestamp: u64,
}

/// Local health endpoint reporting the edge connection state.
pub fn router(status: Arc<WorkerStatus>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(status)
}

async fn health(State(status): State<Arc<WorkerStatus>>) -> impl IntoResponse {
    Json(WorkerHealth {
        status: "ok",
        connected: status.connected.load(Ordering::SeqCst),
        authenticated: status.authenticated.load(Ordering::SeqCst),
        timestamp: protocol::now_ms(),
    })
}

pub async fn serve(listener: TcpListener, status: Arc<WorkerStatus>) -> std::io::Result<()> {
    axum::serve(listener, router(status)).await
}
