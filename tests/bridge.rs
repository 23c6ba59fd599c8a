//! Bridge integration harness.
//!
//! Each test starts a real edge on an ephemeral port and talks to it over
//! real sockets: HTTP via reqwest, and the worker side either as a scripted
//! WebSocket client (so frames can be observed and injected) or as the real
//! worker connection against a mock LM Studio upstream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use lmbridge::config::{EdgeConfig, WorkerConfig};
use lmbridge::edge::{build_router, EdgeState};
use lmbridge::protocol::{decode, encode, Message};
use lmbridge::worker::Connection;

const API_KEY: &str = "test-key";

// ── Harness ──────────────────────────────────────────────────────────────

struct Edge {
    http_base: String,
    ws_url: String,
    state: Arc<EdgeState>,
}

async fn spawn_edge(configure: impl FnOnce(&mut EdgeConfig)) -> Edge {
    let mut config = EdgeConfig::parse_from([
        "lmbridge-edge",
        "--api-key",
        API_KEY,
        "--jwt-secret",
        "test-jwt-secret",
    ]);
    configure(&mut config);

    let state = EdgeState::new(&config, None).expect("valid test config");
    let app = build_router(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Edge {
        http_base: format!("http://{addr}"),
        ws_url: format!("ws://{addr}/ws"),
        state,
    }
}

/// Scripted worker: a bare WebSocket client speaking the bridge protocol,
/// so tests can observe exactly which frames the edge emits.
struct TestWorker {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestWorker {
    async fn connect(edge: &Edge, client_id: &str) -> (TestWorker, String) {
        let (mut ws, _) = connect_async(&edge.ws_url).await.unwrap();
        ws.send(WsMessage::Text(
            encode(&Message::Auth {
                api_key: Some(API_KEY.into()),
                client_id: Some(client_id.into()),
            })
            .into(),
        ))
        .await
        .unwrap();

        let mut worker = TestWorker { ws };
        let token = match worker.next_message().await {
            Some(Message::AuthResult {
                success: true,
                token: Some(token),
                ..
            }) => token,
            other => panic!("expected successful auth result, got {other:?}"),
        };
        (worker, token)
    }

    async fn send(&mut self, msg: &Message) {
        self.ws
            .send(WsMessage::Text(encode(msg).into()))
            .await
            .unwrap();
    }

    /// Next protocol message; answers transport pings, ends on close.
    async fn next_message(&mut self) -> Option<Message> {
        loop {
            match self.ws.next().await? {
                Ok(WsMessage::Text(text)) => {
                    return Some(decode(&text).expect("decodable frame from edge"))
                }
                Ok(WsMessage::Ping(data)) => {
                    let _ = self.ws.send(WsMessage::Pong(data)).await;
                }
                Ok(WsMessage::Close(_)) => return None,
                Err(_) => return None,
                _ => {}
            }
        }
    }

    /// Wait for the close frame, returning its code.
    async fn expect_close(&mut self) -> Option<u16> {
        loop {
            match self.ws.next().await? {
                Ok(WsMessage::Close(frame)) => return frame.map(|f| u16::from(f.code)),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::new()
}

fn authed(req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    req.header("authorization", format!("Bearer {API_KEY}"))
}

fn chat_body() -> Value {
    json!({"model": "x", "messages": [{"role": "user", "content": "hi"}]})
}

/// Answer every models_request with the given payload, counting frames.
fn spawn_models_responder(mut worker: TestWorker, payload: Value) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    tokio::spawn(async move {
        while let Some(msg) = worker.next_message().await {
            if let Message::ModelsRequest { request_id } = msg {
                seen.fetch_add(1, Ordering::SeqCst);
                worker
                    .send(&Message::ModelsResponse {
                        request_id,
                        data: payload.clone(),
                    })
                    .await;
            }
        }
    });
    count
}

// ── Scenarios ────────────────────────────────────────────────────────────

/// S1 — two models requests inside the cache TTL produce one frame.
#[tokio::test]
async fn models_are_cached() {
    let edge = spawn_edge(|_| {}).await;
    let (worker, _token) = TestWorker::connect(&edge, "w1").await;
    let frames = spawn_models_responder(
        worker,
        json!({"object": "list", "data": [{"id": "llama"}]}),
    );

    let client = http_client();
    let first = authed(client.get(format!("{}/v1/models", edge.http_base)))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    let first_body: Value = first.json().await.unwrap();

    let second = authed(client.get(format!("{}/v1/models", edge.http_base)))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    let second_body: Value = second.json().await.unwrap();

    assert_eq!(first_body, second_body);
    assert_eq!(frames.load(Ordering::SeqCst), 1, "second request must hit the cache");
}

/// S2 — no worker connected.
#[tokio::test]
async fn no_worker_yields_503() {
    let edge = spawn_edge(|_| {}).await;

    let resp = authed(http_client().post(format!("{}/v1/chat/completions", edge.http_base)))
        .json(&chat_body())
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["message"], "No available LM Studio clients");
}

/// The models endpoint's 503 keeps the OpenAI list shape.
#[tokio::test]
async fn no_worker_models_body() {
    let edge = spawn_edge(|_| {}).await;

    let resp = authed(http_client().get(format!("{}/v1/models", edge.http_base)))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"], json!([]));
    assert_eq!(body["message"], "No LM Studio clients connected");
}

/// S3 — unary chat happy path.
#[tokio::test]
async fn unary_chat_round_trip() {
    let edge = spawn_edge(|_| {}).await;
    let (mut worker, _token) = TestWorker::connect(&edge, "w1").await;

    tokio::spawn(async move {
        while let Some(msg) = worker.next_message().await {
            if let Message::ChatRequest { request_id, .. } = msg {
                worker
                    .send(&Message::ChatResponse {
                        request_id,
                        data: json!({
                            "choices": [{
                                "message": {"role": "assistant", "content": "ok"},
                                "finish_reason": "stop",
                            }]
                        }),
                    })
                    .await;
            }
        }
    });

    let resp = authed(http_client().post(format!("{}/v1/chat/completions", edge.http_base)))
        .json(&chat_body())
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "ok");
}

/// S4 — streamed chunks arrive in order, terminated by [DONE].
#[tokio::test]
async fn streaming_preserves_order() {
    let edge = spawn_edge(|_| {}).await;
    let (mut worker, _token) = TestWorker::connect(&edge, "w1").await;

    tokio::spawn(async move {
        while let Some(msg) = worker.next_message().await {
            if let Message::ChatRequest {
                request_id, stream, ..
            } = msg
            {
                assert!(stream);
                for chunk in ["A", "B", "C"] {
                    worker
                        .send(&Message::StreamChunk {
                            request_id: request_id.clone(),
                            data: chunk.into(),
                        })
                        .await;
                }
                worker.send(&Message::StreamEnd { request_id }).await;
            }
        }
    });

    let mut body = chat_body();
    body["stream"] = json!(true);
    let resp = authed(http_client().post(format!("{}/v1/chat/completions", edge.http_base)))
        .json(&body)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let text = resp.text().await.unwrap();
    assert_eq!(text, "data: A\n\ndata: B\n\ndata: C\n\ndata: [DONE]\n\n");
}

/// S5 — a silent worker trips the deadline; nothing is left pending.
#[tokio::test]
async fn deadline_yields_504() {
    let edge = spawn_edge(|c| c.request_timeout_ms = 300).await;
    let (mut worker, _token) = TestWorker::connect(&edge, "w1").await;

    // Keep the connection alive but never answer.
    tokio::spawn(async move { while worker.next_message().await.is_some() {} });

    let resp = authed(http_client().post(format!("{}/v1/chat/completions", edge.http_base)))
        .json(&chat_body())
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 504);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["message"], "Request timeout");
    assert!(edge.state.pending.is_empty());
}

/// S6 — dropping the HTTP client mid-stream cancels at the worker.
#[tokio::test]
async fn client_disconnect_cancels() {
    let edge = spawn_edge(|_| {}).await;
    let (mut worker, _token) = TestWorker::connect(&edge, "w1").await;

    let mut body = chat_body();
    body["stream"] = json!(true);
    let resp = authed(http_client().post(format!("{}/v1/chat/completions", edge.http_base)))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let request_id = match worker.next_message().await {
        Some(Message::ChatRequest { request_id, .. }) => request_id,
        other => panic!("expected chat_request, got {other:?}"),
    };

    worker
        .send(&Message::StreamChunk {
            request_id: request_id.clone(),
            data: "A".into(),
        })
        .await;

    // Read one chunk, then hang up.
    let mut stream = resp.bytes_stream();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(&first[..], b"data: A\n\n");
    drop(stream);

    match worker.next_message().await {
        Some(Message::CancelRequest { request_id: cancelled }) => {
            assert_eq!(cancelled, request_id);
        }
        other => panic!("expected cancel_request, got {other:?}"),
    }
    assert!(edge.state.pending.is_empty());
}

// ── Auth and lifecycle ───────────────────────────────────────────────────

#[tokio::test]
async fn http_rejects_bad_credentials() {
    let edge = spawn_edge(|_| {}).await;

    let resp = http_client()
        .get(format!("{}/v1/models", edge.http_base))
        .header("authorization", "Bearer wrong-key")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["message"], "Invalid API key");
    assert_eq!(body["error"]["type"], "api_error");
    assert_eq!(body["error"]["code"], 401);

    let resp = http_client()
        .get(format!("{}/v1/models", edge.http_base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

/// A worker's issued token works as an HTTP credential.
#[tokio::test]
async fn issued_token_accepted_on_http() {
    let edge = spawn_edge(|_| {}).await;
    let (worker, token) = TestWorker::connect(&edge, "w1").await;
    spawn_models_responder(worker, json!({"object": "list", "data": []}));

    let resp = http_client()
        .get(format!("{}/v1/models", edge.http_base))
        .header("authorization", format!("Bearer {token}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn ws_rejects_bad_api_key() {
    let edge = spawn_edge(|_| {}).await;
    let (mut ws, _) = connect_async(&edge.ws_url).await.unwrap();

    ws.send(WsMessage::Text(
        encode(&Message::Auth {
            api_key: Some("wrong".into()),
            client_id: Some("w1".into()),
        })
        .into(),
    ))
    .await
    .unwrap();

    let mut worker = TestWorker { ws };
    match worker.next_message().await {
        Some(Message::AuthResult {
            success: false,
            error: Some(error),
            ..
        }) => assert_eq!(error, "Invalid API key"),
        other => panic!("expected auth failure, got {other:?}"),
    }
    assert_eq!(worker.expect_close().await, Some(1008));
    assert!(edge.state.registry.is_empty());
}

#[tokio::test]
async fn ws_requires_client_id() {
    let edge = spawn_edge(|_| {}).await;
    let (mut ws, _) = connect_async(&edge.ws_url).await.unwrap();

    ws.send(WsMessage::Text(
        encode(&Message::Auth {
            api_key: Some(API_KEY.into()),
            client_id: None,
        })
        .into(),
    ))
    .await
    .unwrap();

    let mut worker = TestWorker { ws };
    match worker.next_message().await {
        Some(Message::AuthResult {
            success: false,
            error: Some(error),
            ..
        }) => assert_eq!(error, "Client ID required"),
        other => panic!("expected auth failure, got {other:?}"),
    }
    assert_eq!(worker.expect_close().await, Some(1008));
}

/// Auth monotonicity: a non-auth first frame never reaches the dispatcher.
#[tokio::test]
async fn ws_rejects_non_auth_first_frame() {
    let edge = spawn_edge(|_| {}).await;
    let (mut ws, _) = connect_async(&edge.ws_url).await.unwrap();

    ws.send(WsMessage::Text(
        encode(&Message::Ping { timestamp: None }).into(),
    ))
    .await
    .unwrap();

    let mut worker = TestWorker { ws };
    match worker.next_message().await {
        Some(Message::Error { error, .. }) => assert_eq!(error, "Authentication required"),
        other => panic!("expected error frame, got {other:?}"),
    }
    assert_eq!(worker.expect_close().await, Some(1008));
    assert!(edge.state.registry.is_empty());
}

/// Registry replacement: a second connection under the same client id
/// closes the first with 1000 and leaves exactly one record.
#[tokio::test]
async fn reconnect_replaces_worker() {
    let edge = spawn_edge(|_| {}).await;
    let (mut first, _) = TestWorker::connect(&edge, "w1").await;
    let (_second, _) = TestWorker::connect(&edge, "w1").await;

    assert_eq!(first.expect_close().await, Some(1000));
    assert_eq!(edge.state.registry.len(), 1);
}

/// With streaming disabled, stream:true is downgraded transparently.
#[tokio::test]
async fn streaming_disabled_downgrades_to_unary() {
    let edge = spawn_edge(|c| c.enable_streaming = false).await;
    let (mut worker, _token) = TestWorker::connect(&edge, "w1").await;

    tokio::spawn(async move {
        while let Some(msg) = worker.next_message().await {
            if let Message::ChatRequest {
                request_id,
                stream,
                data,
            } = msg
            {
                assert!(!stream, "edge must downgrade the frame");
                assert_eq!(data["stream"], json!(false), "and rewrite the body");
                worker
                    .send(&Message::ChatResponse {
                        request_id,
                        data: json!({"choices": []}),
                    })
                    .await;
            }
        }
    });

    let mut body = chat_body();
    body["stream"] = json!(true);
    let resp = authed(http_client().post(format!("{}/v1/chat/completions", edge.http_base)))
        .json(&body)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_ne!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
}

/// Malformed request bodies get the uniform 400 body.
#[tokio::test]
async fn bad_json_body_yields_400() {
    let edge = spawn_edge(|_| {}).await;
    let (worker, _token) = TestWorker::connect(&edge, "w1").await;
    // Worker present so the request gets past worker selection.
    tokio::spawn(async move {
        let mut worker = worker;
        while worker.next_message().await.is_some() {}
    });

    let resp = authed(http_client().post(format!("{}/v1/chat/completions", edge.http_base)))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

/// Worker disconnect fails its in-flight requests immediately.
#[tokio::test]
async fn worker_disconnect_fails_pending() {
    let edge = spawn_edge(|_| {}).await;
    let (mut worker, _token) = TestWorker::connect(&edge, "w1").await;

    let http = tokio::spawn({
        let base = edge.http_base.clone();
        async move {
            authed(http_client().post(format!("{base}/v1/chat/completions")))
                .json(&chat_body())
                .send()
                .await
                .unwrap()
        }
    });

    // Receive the request, then vanish without answering.
    match worker.next_message().await {
        Some(Message::ChatRequest { .. }) => {}
        other => panic!("expected chat_request, got {other:?}"),
    }
    drop(worker);

    let resp = http.await.unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["message"], "LM Studio client disconnected");
    assert!(edge.state.pending.is_empty());
}

// ── Full chain with the real worker ──────────────────────────────────────

/// Mock LM Studio: canned unary and SSE responses.
async fn spawn_mock_lm_studio() -> u16 {
    use axum::routing::{get, post};

    async fn chat(axum::Json(body): axum::Json<Value>) -> axum::response::Response {
        use axum::response::IntoResponse;
        let streaming = body["stream"].as_bool().unwrap_or(false);
        if streaming {
            (
                [("content-type", "text/event-stream")],
                "data: {\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\n\
                 data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
                 data: [DONE]\n\n",
            )
                .into_response()
        } else {
            axum::Json(json!({
                "choices": [{
                    "message": {"role": "assistant", "content": "hello"},
                    "finish_reason": "stop",
                }]
            }))
            .into_response()
        }
    }

    async fn models() -> axum::Json<Value> {
        axum::Json(json!({"object": "list", "data": [{"id": "mock-model"}]}))
    }

    let app = axum::Router::new()
        .route("/v1/chat/completions", post(chat))
        .route("/v1/models", get(models));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

#[tokio::test]
async fn full_chain_with_real_worker() {
    let edge = spawn_edge(|_| {}).await;
    let lm_port = spawn_mock_lm_studio().await;

    let lm_port = lm_port.to_string();
    let config = WorkerConfig::parse_from([
        "lmbridge-worker",
        "--remote-server-url",
        edge.ws_url.as_str(),
        "--api-key",
        API_KEY,
        "--client-id",
        "real-worker",
        "--lm-studio-host",
        "127.0.0.1",
        "--lm-studio-port",
        lm_port.as_str(),
    ]);
    let (connection, status) = Connection::new(&config).unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let run = tokio::spawn(connection.run(shutdown_rx));

    // Wait for registration.
    for _ in 0..100 {
        if !edge.state.registry.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!edge.state.registry.is_empty(), "worker never registered");
    assert!(status.authenticated.load(Ordering::SeqCst));

    // Unary chat through the whole chain.
    let resp = authed(http_client().post(format!("{}/v1/chat/completions", edge.http_base)))
        .json(&chat_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "hello");

    // Streaming chat: the worker parses upstream SSE and re-frames it.
    let mut body = chat_body();
    body["stream"] = json!(true);
    let resp = authed(http_client().post(format!("{}/v1/chat/completions", edge.http_base)))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let text = resp.text().await.unwrap();
    assert_eq!(
        text,
        "data: {\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\n\
         data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
         data: [DONE]\n\n"
    );

    // Models through the whole chain.
    let resp = authed(http_client().get(format!("{}/v1/models", edge.http_base)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"][0]["id"], "mock-model");

    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), run).await;
}
