use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Failure kinds that can terminate a bridged request.
///
/// Worker-side instances travel as `error`/`error_response` frames;
/// edge-side instances map onto HTTP status codes and the uniform
/// OpenAI-style error body.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("{0}")]
    Auth(String),

    #[error("No available LM Studio clients")]
    NoWorker,

    #[error("Request timeout")]
    Timeout,

    #[error("LM Studio client disconnected")]
    WorkerGone,

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Unknown message type: {0}")]
    UnknownTag(String),

    #[error("{0}")]
    Internal(String),
}

impl BridgeError {
    pub fn status(&self) -> StatusCode {
        match self {
            BridgeError::Auth(_) => StatusCode::UNAUTHORIZED,
            BridgeError::NoWorker | BridgeError::WorkerGone => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            BridgeError::Upstream(_) | BridgeError::UnknownTag(_) | BridgeError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            BridgeError::BadRequest(_) => "invalid_request_error",
            _ => "api_error",
        }
    }
}

/// The uniform `{error:{message,type,code}}` body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: u16,
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: ErrorDetail {
                message: self.to_string(),
                kind: self.kind().to_string(),
                code: status.as_u16(),
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            BridgeError::Auth("Invalid API key".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(BridgeError::NoWorker.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(BridgeError::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            BridgeError::BadRequest("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            BridgeError::Upstream("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_body_shape() {
        let body = ErrorBody {
            error: ErrorDetail {
                message: "Invalid API key".into(),
                kind: "api_error".into(),
                code: 401,
            },
        };
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(
            json,
            r#"{"error":{"message":"Invalid API key","type":"api_error","code":401}}"#
        );
    }

    #[test]
    fn test_timeout_message() {
        assert_eq!(BridgeError::Timeout.to_string(), "Request timeout");
    }
}
