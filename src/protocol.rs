use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Wire messages exchanged between edge and worker.
///
/// Every message is one UTF-8 JSON object per WebSocket text frame, tagged
/// by `type`. Request/response payloads (`data`) are opaque OpenAI-schema
/// JSON passed through unmodified.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Message {
    /// First frame on a new worker connection.
    Auth {
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default)]
        client_id: Option<String>,
    },
    /// Edge's reply to `auth`; carries a signed token on success.
    AuthResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    ChatRequest {
        request_id: String,
        #[serde(default)]
        stream: bool,
        data: Value,
    },
    CompletionRequest {
        request_id: String,
        #[serde(default)]
        stream: bool,
        data: Value,
    },
    EmbeddingsRequest {
        request_id: String,
        data: Value,
    },
    ModelsRequest {
        request_id: String,
    },
    /// Edge asks the worker to abort the upstream call and go silent
    /// for this request id.
    CancelRequest {
        request_id: String,
    },
    ChatResponse {
        request_id: String,
        data: Value,
    },
    CompletionResponse {
        request_id: String,
        data: Value,
    },
    EmbeddingsResponse {
        request_id: String,
        data: Value,
    },
    ModelsResponse {
        request_id: String,
        data: Value,
    },
    /// One ordered piece of a streaming response. `data` is a JSON fragment
    /// in the upstream OpenAI chunk shape, forwarded verbatim.
    StreamChunk {
        request_id: String,
        data: String,
    },
    StreamEnd {
        request_id: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: String,
    },
    ErrorResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: String,
    },
}

/// What a pending request is asking for; selects the request frame,
/// the expected response frame, and the deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Chat,
    Completion,
    Embeddings,
    Models,
}

/// Whether a request resolves with a single response frame or with an
/// ordered `stream_chunk* , stream_end | error` sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    Unary,
    Stream,
}

/// The closed set of wire tags, in canonical lowercase form.
const KNOWN_TAGS: &[&str] = &[
    "auth",
    "auth_result",
    "ping",
    "pong",
    "chat_request",
    "completion_request",
    "embeddings_request",
    "models_request",
    "cancel_request",
    "chat_response",
    "completion_response",
    "embeddings_response",
    "models_response",
    "stream_chunk",
    "stream_end",
    "error",
    "error_response",
];

/// Why an inbound frame could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The `type` field named no known tag even after normalization.
    #[error("Unknown message type: {0}")]
    UnknownTag(String),

    /// The frame had no `type` field at all.
    #[error("Unknown message type: <missing>")]
    MissingType,

    /// Not a JSON object, or the fields for the tag did not deserialize.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Decode one text frame into a [`Message`].
///
/// Tags are compared case-insensitively after trimming whitespace; the
/// normalized tag is looked up in the closed tag table before the typed
/// deserialize runs, so an unrecognized tag surfaces as
/// [`DecodeError::UnknownTag`] rather than a generic serde error.
pub fn decode(text: &str) -> Result<Message, DecodeError> {
    let mut value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let obj = value
        .as_object_mut()
        .ok_or_else(|| DecodeError::Malformed("frame is not a JSON object".into()))?;

    let raw_tag = match obj.get("type").and_then(Value::as_str) {
        Some(tag) => tag.to_string(),
        None => return Err(DecodeError::MissingType),
    };

    let normalized = raw_tag.trim().to_ascii_lowercase();
    if !KNOWN_TAGS.contains(&normalized.as_str()) {
        return Err(DecodeError::UnknownTag(raw_tag.trim().to_string()));
    }
    obj.insert("type".into(), Value::String(normalized));

    serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// Encode a message as one JSON text frame.
pub fn encode(msg: &Message) -> String {
    serde_json::to_string(msg).expect("message serializes to JSON")
}

/// Milliseconds since the Unix epoch, for envelope timestamps.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
