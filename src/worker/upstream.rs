use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use url::Url;

/// Cap on how much of an upstream error body travels back to clients.
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Request(String),

    #[error("upstream returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid upstream URL: {0}")]
    Url(String),
}

/// HTTP adapter for the local inference runtime (LM Studio).
///
/// `/v1/models` is fetched with GET, everything else with POST. Streaming
/// requests are opened with `Accept: text/event-stream` and their body
/// exposed as a byte stream for the connection's stream bridge.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    base_url: Url,
    http: reqwest::Client,
    unary_timeout: Duration,
    stream_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(
        host: &str,
        port: u16,
        unary_timeout: Duration,
        stream_timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let base_url = Url::parse(&format!("http://{host}:{port}"))
            .map_err(|e| UpstreamError::Url(e.to_string()))?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| UpstreamError::Request(e.to_string()))?;

        Ok(Self {
            base_url,
            http,
            unary_timeout,
            stream_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    fn endpoint(&self, path: &str) -> Result<Url, UpstreamError> {
        self.base_url
            .join(path)
            .map_err(|e| UpstreamError::Url(e.to_string()))
    }

    /// GET the models listing.
    pub async fn fetch_models(&self) -> Result<Value, UpstreamError> {
        let url = self.endpoint("/v1/models")?;
        let resp = self
            .http
            .get(url)
            .timeout(self.unary_timeout)
            .send()
            .await
            .map_err(|e| UpstreamError::Request(e.to_string()))?;
        let resp = check_status(resp).await?;
        resp.json()
            .await
            .map_err(|e| UpstreamError::Request(e.to_string()))
    }

    /// POST a unary request and return the JSON response.
    pub async fn post_unary(&self, path: &str, payload: &Value) -> Result<Value, UpstreamError> {
        let url = self.endpoint(path)?;
        let resp = self
            .http
            .post(url)
            .timeout(self.unary_timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| UpstreamError::Request(e.to_string()))?;
        let resp = check_status(resp).await?;
        resp.json()
            .await
            .map_err(|e| UpstreamError::Request(e.to_string()))
    }

    /// POST a streaming request; the caller reads the SSE body. The timeout
    /// covers the whole body, not just the response headers.
    pub async fn open_stream(
        &self,
        path: &str,
        payload: &Value,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = self.endpoint(path)?;
        let resp = self
            .http
            .post(url)
            .timeout(self.stream_timeout)
            .header("accept", "text/event-stream")
            .json(payload)
            .send()
            .await
            .map_err(|e| UpstreamError::Request(e.to_string()))?;
        check_status(resp).await
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let mut message = resp.text().await.unwrap_or_default();
    message.truncate(ERROR_BODY_LIMIT);
    Err(UpstreamError::Status {
        status: status.as_u16(),
        message,
    })
}

/// One event extracted from an upstream SSE body.
#[derive(Debug, PartialEq, Eq)]
pub enum SseEvent {
    /// A `data:` payload, prefix stripped.
    Data(String),
    /// The upstream `[DONE]` sentinel.
    Done,
}

/// Incremental SSE splitter. Feeds arrive in arbitrary byte slices; events
/// are complete only at a blank line, so a partial event stays buffered
/// until the next feed.
#[derive(Default)]
pub struct SseSplitter {
    buf: String,
}

impl SseSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        // Carriage returns only complicate the separator scan
        self.buf
            .push_str(&String::from_utf8_lossy(bytes).replace('\r', ""));

        let mut events = Vec::new();
        while let Some(idx) = self.buf.find("\n\n") {
            let block: String = self.buf.drain(..idx + 2).collect();
            for line in block.lines() {
                let Some(rest) = line.strip_prefix("data:") else {
                    continue;
                };
                let payload = rest.strip_prefix(' ').unwrap_or(rest);
                if payload == "[DONE]" {
                    events.push(SseEvent::Done);
                } else if !payload.is_empty() {
                    events.push(SseEvent::Data(payload.to_string()));
                }
            }
        }
        events
    }
}
