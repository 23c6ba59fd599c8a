pub mod cache;
pub mod handlers;
pub mod logging;
pub mod middleware;
pub mod pending;
pub mod ratelimit;
pub mod registry;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::middleware as axum_middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::auth::TokenSigner;
use crate::config::{ConfigError, EdgeConfig};

use self::cache::ModelsCache;
use self::pending::PendingTable;
use self::ratelimit::RateLimiter;
use self::registry::WorkerRegistry;

/// Shared edge state. Constructed once at startup and passed to handlers;
/// nothing here is a global.
pub struct EdgeState {
    pub config: EdgeConfig,
    pub api_key: String,
    pub signer: TokenSigner,
    pub registry: WorkerRegistry,
    pub pending: Arc<PendingTable>,
    pub models_cache: ModelsCache,
    pub rate_limiter: Option<RateLimiter>,
}

impl EdgeState {
    pub fn new(
        config: &EdgeConfig,
        rate_limiter: Option<RateLimiter>,
    ) -> Result<Arc<Self>, ConfigError> {
        let api_key = config.api_key.clone().ok_or(ConfigError::MissingApiKey)?;
        let jwt_secret = config
            .jwt_secret
            .clone()
            .ok_or(ConfigError::MissingJwtSecret)?;
        if !config.ws_path.starts_with('/') {
            return Err(ConfigError::InvalidWsPath);
        }

        Ok(Arc::new(Self {
            config: config.clone(),
            api_key,
            signer: TokenSigner::new(&jwt_secret, Duration::from_secs(config.jwt_expires_in)),
            registry: WorkerRegistry::new(),
            pending: PendingTable::new(),
            models_cache: ModelsCache::new(),
            rate_limiter,
        }))
    }
}

/// Build the axum router with public and protected route split.
pub fn build_router(state: Arc<EdgeState>) -> Router {
    let public_routes = Router::new()
        .route("/health", get(handlers::health))
        .route(&state.config.ws_path, get(ws::ws_handler));

    let protected_routes = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/embeddings", post(handlers::embeddings))
        .route("/v1/models", get(handlers::models))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(axum_middleware::from_fn(logging::request_logging))
        .with_state(state)
}
