use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, WorkerConfig};
use crate::protocol::{self, Message, RequestKind};

use super::upstream::{SseEvent, SseSplitter, UpstreamClient};

/// App-level keepalive toward the edge.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for the edge's `auth_result`.
const AUTH_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type InflightMap = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

/// Flags shared with the local health endpoint.
#[derive(Debug, Default)]
pub struct WorkerStatus {
    pub connected: AtomicBool,
    pub authenticated: AtomicBool,
}

/// Connection lifecycle. Every transport failure lands back in
/// `Disconnected`, and the run loop re-dials after the configured interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Dialing,
    /// Transport up, `auth` sent, reply outstanding.
    Connected,
    Authenticated,
    Serving,
}

/// The worker's single persistent connection to the edge.
#[derive(Debug)]
pub struct Connection {
    url: String,
    api_key: String,
    client_id: String,
    reconnect_interval: Duration,
    upstream: UpstreamClient,
    status: Arc<WorkerStatus>,
    state: ConnectionState,
}

impl Connection {
    pub fn new(config: &WorkerConfig) -> Result<(Self, Arc<WorkerStatus>), ConfigError> {
        let url = config
            .remote_server_url
            .clone()
            .ok_or(ConfigError::MissingRemoteUrl)?;
        let parsed =
            url::Url::parse(&url).map_err(|e| ConfigError::InvalidRemoteUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidRemoteUrl(format!(
                "scheme must be ws or wss, got {}",
                parsed.scheme()
            )));
        }

        let api_key = config.api_key.clone().ok_or(ConfigError::MissingApiKey)?;
        let client_id = config.client_id.clone().ok_or(ConfigError::MissingClientId)?;

        let upstream = UpstreamClient::new(
            &config.lm_studio_host,
            config.lm_studio_port,
            Duration::from_secs(config.upstream_timeout_secs),
            Duration::from_secs(config.upstream_stream_timeout_secs),
        )
        .map_err(|e| ConfigError::InvalidUpstream(e.to_string()))?;

        let status = Arc::new(WorkerStatus::default());
        let connection = Self {
            url,
            api_key,
            client_id,
            reconnect_interval: config.reconnect_interval(),
            upstream,
            status: status.clone(),
            state: ConnectionState::Disconnected,
        };
        Ok((connection, status))
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "connection state");
            self.state = next;
        }
        let connected = matches!(
            next,
            ConnectionState::Connected | ConnectionState::Authenticated | ConnectionState::Serving
        );
        let authenticated =
            matches!(next, ConnectionState::Authenticated | ConnectionState::Serving);
        self.status.connected.store(connected, Ordering::SeqCst);
        self.status.authenticated.store(authenticated, Ordering::SeqCst);
    }

    /// Dial, serve, and re-dial until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            self.transition(ConnectionState::Dialing);
            info!(url = %self.url, "connecting to edge");

            match connect_async(&self.url).await {
                Ok((ws, _response)) => {
                    self.transition(ConnectionState::Connected);
                    match self.serve(ws, &mut shutdown).await {
                        Ok(()) => {
                            // Clean shutdown
                            self.transition(ConnectionState::Disconnected);
                            return;
                        }
                        Err(e) => warn!(error = %e, "edge connection lost"),
                    }
                }
                Err(e) => warn!(url = %self.url, error = %e, "connection failed"),
            }

            self.transition(ConnectionState::Disconnected);
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(self.reconnect_interval) => {}
            }
        }
    }

    /// One connected session: authenticate, then serve requests until the
    /// transport drops or shutdown is signalled.
    async fn serve(
        &mut self,
        ws: WsStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), String> {
        let (mut sender, mut receiver) = ws.split();

        // Authenticate before anything else; the edge drops connections
        // whose first frame is not auth.
        send_message(
            &mut sender,
            &Message::Auth {
                api_key: Some(self.api_key.clone()),
                client_id: Some(self.client_id.clone()),
            },
        )
        .await?;

        let reply = tokio::time::timeout(AUTH_REPLY_TIMEOUT, async {
            while let Some(frame) = receiver.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => return Some(text.to_string()),
                    Ok(WsMessage::Close(_)) | Err(_) => return None,
                    _ => continue,
                }
            }
            None
        })
        .await
        .map_err(|_| "timed out waiting for auth result".to_string())?
        .ok_or_else(|| "connection closed during auth".to_string())?;

        match protocol::decode(&reply) {
            Ok(Message::AuthResult { success: true, .. }) => {
                self.transition(ConnectionState::Authenticated);
                info!(client_id = %self.client_id, "authenticated with edge");
            }
            Ok(Message::AuthResult {
                success: false,
                error,
                ..
            }) => {
                return Err(format!(
                    "authentication rejected: {}",
                    error.unwrap_or_else(|| "unknown reason".into())
                ));
            }
            Ok(other) => return Err(format!("unexpected auth reply: {other:?}")),
            Err(e) => return Err(format!("bad auth reply: {e}")),
        }

        self.transition(ConnectionState::Serving);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let inflight: InflightMap = Arc::new(Mutex::new(HashMap::new()));

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await; // the immediate tick

        let result = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("disconnecting from edge");
                        let _ = sender.close().await;
                        break Ok(());
                    }
                }

                _ = ping.tick() => {
                    let ping_msg = Message::Ping { timestamp: Some(protocol::now_ms()) };
                    if let Err(e) = send_message(&mut sender, &ping_msg).await {
                        break Err(e);
                    }
                }

                Some(msg) = out_rx.recv() => {
                    if let Err(e) = send_message(&mut sender, &msg).await {
                        break Err(e);
                    }
                }

                frame = receiver.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        self.handle_frame(&text, &out_tx, &inflight);
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = sender.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close(_))) | None => {
                        break Err("connection closed by edge".to_string());
                    }
                    Some(Err(e)) => break Err(format!("websocket error: {e}")),
                    Some(Ok(_)) => {}
                },
            }
        };

        // No frames may follow for aborted requests.
        for (_, task) in inflight.lock().unwrap().drain() {
            task.abort();
        }

        result
    }

    /// Route one frame from the edge.
    fn handle_frame(
        &self,
        text: &str,
        out_tx: &mpsc::UnboundedSender<Message>,
        inflight: &InflightMap,
    ) {
        let msg = match protocol::decode(text) {
            Ok(msg) => msg,
            Err(e @ protocol::DecodeError::UnknownTag(_))
            | Err(e @ protocol::DecodeError::MissingType) => {
                let _ = out_tx.send(Message::Error {
                    request_id: None,
                    error: e.to_string(),
                });
                return;
            }
            Err(protocol::DecodeError::Malformed(e)) => {
                warn!(error = %e, "dropping malformed frame from edge");
                return;
            }
        };

        match msg {
            Message::ChatRequest {
                request_id,
                stream,
                data,
            } => self.spawn_request(RequestKind::Chat, request_id, stream, data, out_tx, inflight),

            Message::CompletionRequest {
                request_id,
                stream,
                data,
            } => self.spawn_request(
                RequestKind::Completion,
                request_id,
                stream,
                data,
                out_tx,
                inflight,
            ),

            Message::EmbeddingsRequest { request_id, data } => self.spawn_request(
                RequestKind::Embeddings,
                request_id,
                false,
                data,
                out_tx,
                inflight,
            ),

            Message::ModelsRequest { request_id } => self.spawn_request(
                RequestKind::Models,
                request_id,
                false,
                Value::Null,
                out_tx,
                inflight,
            ),

            Message::CancelRequest { request_id } => {
                if let Some(task) = inflight.lock().unwrap().remove(&request_id) {
                    task.abort();
                    debug!(request_id, "request cancelled by edge");
                }
            }

            Message::Ping { .. } => {
                let _ = out_tx.send(Message::Pong {
                    timestamp: Some(protocol::now_ms()),
                });
            }
            Message::Pong { .. } => {}

            Message::Error { error, .. } => {
                warn!(error, "error frame from edge");
            }

            other => {
                debug!(frame = ?other, "unexpected frame from edge ignored");
            }
        }
    }

    /// Run one request against the upstream runtime on its own task, so a
    /// slow generation never blocks the read loop.
    fn spawn_request(
        &self,
        kind: RequestKind,
        request_id: String,
        stream: bool,
        data: Value,
        out_tx: &mpsc::UnboundedSender<Message>,
        inflight: &InflightMap,
    ) {
        let upstream = self.upstream.clone();
        let out = out_tx.clone();
        let map = inflight.clone();
        let id = request_id.clone();

        let task = tokio::spawn(async move {
            if stream {
                run_streaming(&upstream, upstream_path(kind), &data, &id, &out).await;
            } else {
                run_unary(&upstream, kind, &data, &id, &out).await;
            }
            map.lock().unwrap().remove(&id);
        });

        inflight.lock().unwrap().insert(request_id, task);
    }
}

async fn run_unary(
    upstream: &UpstreamClient,
    kind: RequestKind,
    data: &Value,
    request_id: &str,
    out: &mpsc::UnboundedSender<Message>,
) {
    let result = match kind {
        RequestKind::Models => upstream.fetch_models().await,
        _ => upstream.post_unary(upstream_path(kind), data).await,
    };

    match result {
        Ok(payload) => {
            let _ = out.send(response_message(kind, request_id, payload));
        }
        Err(e) => {
            warn!(request_id, error = %e, "upstream request failed");
            let _ = out.send(Message::Error {
                request_id: Some(request_id.to_string()),
                error: e.to_string(),
            });
        }
    }
}

/// Bridge the upstream SSE body into `stream_chunk* , stream_end | error`.
async fn run_streaming(
    upstream: &UpstreamClient,
    path: &str,
    data: &Value,
    request_id: &str,
    out: &mpsc::UnboundedSender<Message>,
) {
    let resp = match upstream.open_stream(path, data).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(request_id, error = %e, "upstream stream failed to open");
            let _ = out.send(Message::Error {
                request_id: Some(request_id.to_string()),
                error: e.to_string(),
            });
            return;
        }
    };

    let mut splitter = SseSplitter::new();
    let mut body = resp.bytes_stream();

    while let Some(item) = body.next().await {
        match item {
            Ok(bytes) => {
                for event in splitter.feed(&bytes) {
                    match event {
                        SseEvent::Data(payload) => {
                            let sent = out.send(Message::StreamChunk {
                                request_id: request_id.to_string(),
                                data: payload,
                            });
                            if sent.is_err() {
                                return;
                            }
                        }
                        SseEvent::Done => {
                            let _ = out.send(Message::StreamEnd {
                                request_id: request_id.to_string(),
                            });
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(request_id, error = %e, "upstream stream error");
                let _ = out.send(Message::Error {
                    request_id: Some(request_id.to_string()),
                    error: format!("upstream stream error: {e}"),
                });
                return;
            }
        }
    }

    // Upstream closed without a [DONE] sentinel; end of body ends the stream.
    let _ = out.send(Message::StreamEnd {
        request_id: request_id.to_string(),
    });
}

fn upstream_path(kind: RequestKind) -> &'static str {
    match kind {
        RequestKind::Chat => "/v1/chat/completions",
        RequestKind::Completion => "/v1/completions",
        RequestKind::Embeddings => "/v1/embeddings",
        RequestKind::Models => "/v1/models",
    }
}

fn response_message(kind: RequestKind, request_id: &str, data: Value) -> Message {
    let request_id = request_id.to_string();
    match kind {
        RequestKind::Chat => Message::ChatResponse { request_id, data },
        RequestKind::Completion => Message::CompletionResponse { request_id, data },
        RequestKind::Embeddings => Message::EmbeddingsResponse { request_id, data },
        RequestKind::Models => Message::ModelsResponse { request_id, data },
    }
}

async fn send_message(sender: &mut WsSink, msg: &Message) -> Result<(), String> {
    sender
        .send(WsMessage::Text(protocol::encode(msg).into()))
        .await
        .map_err(|e| format!("failed to send frame: {e}"))
}
