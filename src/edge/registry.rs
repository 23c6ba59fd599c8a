use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::BridgeError;
use crate::protocol::Message;

/// Frames the socket task writes on behalf of the rest of the edge.
/// The per-worker channel is the single writer, so frames from different
/// requests are serialized here.
#[derive(Debug)]
pub enum OutboundFrame {
    Message(Message),
    /// Low-level WS control ping from the liveness supervisor.
    Ping,
    /// Close the socket with a code and reason, then stop.
    Close { code: u16, reason: &'static str },
    /// Drop the socket abruptly.
    Terminate,
}

/// One authenticated worker connection.
pub struct WorkerHandle {
    client_id: String,
    /// Distinguishes this connection from a replacement under the same
    /// client id, so cleanup of the old socket cannot touch entries owned
    /// by the new one.
    conn_id: String,
    tx: mpsc::UnboundedSender<OutboundFrame>,
    authenticated: bool,
    alive: AtomicBool,
    open: AtomicBool,
    last_pong: Mutex<Option<Instant>>,
}

impl WorkerHandle {
    pub fn new(client_id: String, tx: mpsc::UnboundedSender<OutboundFrame>) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            conn_id: Uuid::new_v4().to_string(),
            tx,
            authenticated: true,
            alive: AtomicBool::new(true),
            open: AtomicBool::new(true),
            last_pong: Mutex::new(None),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn send(&self, frame: OutboundFrame) -> Result<(), BridgeError> {
        self.tx.send(frame).map_err(|_| BridgeError::WorkerGone)
    }

    pub fn send_message(&self, msg: Message) -> Result<(), BridgeError> {
        self.send(OutboundFrame::Message(msg))
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Called by the socket task when its loop exits.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Record a WS control pong.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Release);
        *self.last_pong.lock().unwrap() = Some(Instant::now());
    }

    /// Cleared by the supervisor before each control ping.
    pub fn clear_alive(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn last_pong(&self) -> Option<Instant> {
        *self.last_pong.lock().unwrap()
    }
}

/// Registry of connected workers, keyed by client id.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: DashMap<String, Arc<WorkerHandle>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker. An existing record under the same client id is
    /// replaced and its transport closed with code 1000.
    pub fn add(&self, handle: Arc<WorkerHandle>) {
        let client_id = handle.client_id().to_string();
        if let Some(old) = self.workers.insert(client_id.clone(), handle) {
            info!(client_id, "replacing existing worker connection");
            let _ = old.send(OutboundFrame::Close {
                code: 1000,
                reason: "replaced",
            });
        } else {
            info!(client_id, "worker registered");
        }
    }

    /// Remove a worker, but only if the registry still holds this exact
    /// connection (a replacement must not be removed by the old socket's
    /// cleanup).
    pub fn remove(&self, handle: &Arc<WorkerHandle>) {
        let removed = self
            .workers
            .remove_if(handle.client_id(), |_, current| Arc::ptr_eq(current, handle));
        if removed.is_some() {
            info!(client_id = handle.client_id(), "worker removed");
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<WorkerHandle>> {
        self.workers.get(client_id).map(|r| r.clone())
    }

    /// First worker whose transport is open and authenticated. The model
    /// hint is accepted but not yet used for selection.
    pub fn pick_available(&self, _model_hint: Option<&str>) -> Option<Arc<WorkerHandle>> {
        self.workers
            .iter()
            .find(|r| r.is_open() && r.authenticated)
            .map(|r| r.clone())
    }

    /// Snapshot of all handles, for the liveness sweep.
    pub fn handles(&self) -> Vec<Arc<WorkerHandle>> {
        self.workers.iter().map(|r| r.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn send_to(&self, client_id: &str, msg: Message) -> Result<(), BridgeError> {
        match self.get(client_id) {
            Some(handle) => handle.send_message(msg),
            None => {
                warn!(client_id, "send to unknown worker");
                Err(BridgeError::WorkerGone)
            }
        }
    }
}
