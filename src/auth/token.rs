use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::AuthError;

/// Claims carried by a worker bearer token.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenClaims {
    /// The worker's client id.
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
}

/// Issues and verifies HS256 bearer tokens for workers.
///
/// Tokens are signed with the process-wide `JWT_SECRET` and handed to a
/// worker on successful WebSocket auth. They are also accepted on the HTTP
/// side interchangeably with the raw API key.
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    expires_in: Duration,
}

impl TokenSigner {
    pub fn new(secret: &str, expires_in: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            expires_in,
        }
    }

    /// Sign a token for the given client id.
    pub fn issue(&self, client_id: &str) -> Result<String, AuthError> {
        let now = now_secs();
        let claims = TokenClaims {
            sub: client_id.to_string(),
            iat: now,
            exp: now + self.expires_in.as_secs(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }

    /// Verify a token and return its claims.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<TokenClaims>(token, &self.decoding, &validation).map_err(|e| {
            if e.kind() == &jsonwebtoken::errors::ErrorKind::ExpiredSignature {
                AuthError::ExpiredToken
            } else {
                AuthError::InvalidToken(e.to_string())
            }
        })?;

        Ok(data.claims)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
