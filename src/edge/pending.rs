use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::protocol::{RequestKind, RequestMode};

/// Terminal result of a unary request.
#[derive(Debug)]
pub enum Outcome {
    Success(Value),
    Failure(BridgeError),
}

/// One event on a streaming request's sink.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(String),
    End,
    Error(BridgeError),
}

/// Where a pending entry's outcome is delivered.
pub enum OutcomeSink {
    Unary(oneshot::Sender<Outcome>),
    Stream(mpsc::UnboundedSender<StreamEvent>),
}

struct Entry {
    kind: RequestKind,
    mode: RequestMode,
    /// Connection id of the owning worker socket.
    worker_id: String,
    sink: OutcomeSink,
    deadline: JoinHandle<()>,
}

/// In-flight request table correlating worker frames back to HTTP handlers.
///
/// A mutex-protected map with per-entry sinks: the HTTP handler task and the
/// worker read-loop task race on the same ids, and removal-before-delivery
/// under the lock guarantees at most one terminal outcome per entry. Each
/// entry carries a deadline task that fails it with `Timeout` unless a
/// terminal event lands first.
pub struct PendingTable {
    entries: Mutex<HashMap<String, Entry>>,
    /// Handed to deadline tasks; always upgradable while callers hold the Arc.
    weak: Weak<PendingTable>,
}

impl PendingTable {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            entries: Mutex::new(HashMap::new()),
            weak: weak.clone(),
        })
    }

    /// Register an entry and start its deadline timer.
    pub fn register(
        &self,
        request_id: &str,
        kind: RequestKind,
        mode: RequestMode,
        worker_id: &str,
        sink: OutcomeSink,
        deadline: Duration,
    ) {
        let table = self.weak.upgrade().expect("pending table still referenced");
        let id = request_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            table.fail(&id, BridgeError::Timeout);
        });

        let entry = Entry {
            kind,
            mode,
            worker_id: worker_id.to_string(),
            sink,
            deadline: timer,
        };

        let prior = self
            .entries
            .lock()
            .unwrap()
            .insert(request_id.to_string(), entry);
        if let Some(prior) = prior {
            // Request ids are uuids; a collision here is a caller bug.
            warn!(request_id, "pending entry overwritten");
            prior.deadline.abort();
        }
    }

    /// Deliver a successful unary response. A response arriving for a
    /// streaming entry is delivered as a single chunk followed by end.
    pub fn resolve(&self, request_id: &str, value: Value) {
        let Some(entry) = self.take(request_id) else {
            warn!(request_id, "late response dropped");
            return;
        };
        match entry.sink {
            OutcomeSink::Unary(tx) => {
                if tx.send(Outcome::Success(value)).is_err() {
                    debug!(request_id, "response receiver gone");
                }
            }
            OutcomeSink::Stream(tx) => {
                let chunk = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                let _ = tx.send(StreamEvent::Chunk(chunk));
                let _ = tx.send(StreamEvent::End);
            }
        }
    }

    /// Deliver a terminal failure.
    pub fn fail(&self, request_id: &str, err: BridgeError) {
        let Some(entry) = self.take(request_id) else {
            debug!(request_id, "late failure dropped");
            return;
        };
        match entry.sink {
            OutcomeSink::Unary(tx) => {
                if tx.send(Outcome::Failure(err)).is_err() {
                    debug!(request_id, "failure receiver gone");
                }
            }
            OutcomeSink::Stream(tx) => {
                let _ = tx.send(StreamEvent::Error(err));
            }
        }
    }

    /// Forward one stream chunk. Chunks for unknown ids (after stream end,
    /// cancellation or timeout) are discarded.
    pub fn feed_chunk(&self, request_id: &str, chunk: String) {
        let entries = self.entries.lock().unwrap();
        match entries.get(request_id) {
            Some(entry) => match &entry.sink {
                OutcomeSink::Stream(tx) => {
                    let _ = tx.send(StreamEvent::Chunk(chunk));
                }
                OutcomeSink::Unary(_) => {
                    warn!(request_id, "stream chunk for unary request dropped");
                }
            },
            None => {
                warn!(request_id, "stream chunk after completion discarded");
            }
        }
    }

    /// Terminate a stream normally.
    pub fn finish_stream(&self, request_id: &str) {
        let Some(entry) = self.take(request_id) else {
            warn!(request_id, "late stream end dropped");
            return;
        };
        match entry.sink {
            OutcomeSink::Stream(tx) => {
                let _ = tx.send(StreamEvent::End);
            }
            OutcomeSink::Unary(tx) => {
                warn!(request_id, "stream end for unary request");
                let _ = tx.send(Outcome::Failure(BridgeError::Internal(
                    "stream end for unary request".into(),
                )));
            }
        }
    }

    /// Remove an entry because the HTTP client went away. Nothing is
    /// delivered. Returns whether the entry was still pending, so the
    /// caller knows whether to notify the worker.
    pub fn cancel_by_client(&self, request_id: &str) -> bool {
        match self.take(request_id) {
            Some(_) => {
                debug!(request_id, "cancelled by client");
                true
            }
            None => false,
        }
    }

    /// Fail every entry owned by a closed worker connection.
    pub fn fail_worker(&self, worker_id: &str) {
        let failed: Vec<(String, Entry)> = {
            let mut entries = self.entries.lock().unwrap();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.worker_id == worker_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|e| (id, e)))
                .collect()
        };

        for (id, entry) in failed {
            entry.deadline.abort();
            warn!(request_id = id, worker_id, "worker gone, failing request");
            match entry.sink {
                OutcomeSink::Unary(tx) => {
                    let _ = tx.send(Outcome::Failure(BridgeError::WorkerGone));
                }
                OutcomeSink::Stream(tx) => {
                    let _ = tx.send(StreamEvent::Error(BridgeError::WorkerGone));
                }
            }
        }
    }

    pub fn kind_of(&self, request_id: &str) -> Option<RequestKind> {
        self.entries.lock().unwrap().get(request_id).map(|e| e.kind)
    }

    pub fn mode_of(&self, request_id: &str) -> Option<RequestMode> {
        self.entries.lock().unwrap().get(request_id).map(|e| e.mode)
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.lock().unwrap().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    fn take(&self, request_id: &str) -> Option<Entry> {
        let entry = self.entries.lock().unwrap().remove(request_id)?;
        entry.deadline.abort();
        Some(entry)
    }
}
