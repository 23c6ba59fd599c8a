use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::BridgeError;

use super::EdgeState;

/// Who a `/v1/*` request authenticated as.
#[derive(Debug, Clone)]
pub enum AuthIdentity {
    /// A signed worker token; carries the token's subject.
    Token { client_id: String },
    /// The raw shared API key.
    ApiKey,
}

impl AuthIdentity {
    /// Stable key for rate-limit buckets.
    pub fn bucket_id(&self) -> &str {
        match self {
            AuthIdentity::Token { client_id } => client_id,
            AuthIdentity::ApiKey => "api-key",
        }
    }
}

/// Bearer auth for the HTTP surface: a valid, unexpired signed token is
/// accepted first; otherwise the credential must byte-equal the configured
/// API key. Everything else is a 401 with the uniform body.
pub async fn auth_middleware(
    State(state): State<Arc<EdgeState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let credential = match bearer_credential(&req) {
        Some(c) => c,
        None => return reject(),
    };

    let identity = if let Ok(claims) = state.signer.verify(credential) {
        AuthIdentity::Token {
            client_id: claims.sub,
        }
    } else if credential == state.api_key {
        AuthIdentity::ApiKey
    } else {
        return reject();
    };

    req.extensions_mut().insert(identity);
    next.run(req).await
}

fn bearer_credential(req: &Request<Body>) -> Option<&str> {
    req.headers()
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn reject() -> Response {
    BridgeError::Auth("Invalid API key".into()).into_response()
}
