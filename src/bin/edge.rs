use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use lmbridge::config::{init_tracing, EdgeConfig};
use lmbridge::edge::ratelimit::{RateLimiter, RateLimiterConfig};
use lmbridge::edge::{build_router, ws, EdgeState};

#[tokio::main]
async fn main() {
    let config = EdgeConfig::parse();

    init_tracing(&config.log_level, &config.log_format);

    // Rate limiter
    let rate_limiter = if config.rate_limit_rpm > 0 {
        let hash_key = match std::env::var("IDENTITY_HASH_KEY") {
            Ok(hex_str) => {
                let bytes = hex::decode(&hex_str).unwrap_or_else(|_| {
                    error!("IDENTITY_HASH_KEY must be hex-encoded");
                    std::process::exit(1);
                });
                if bytes.len() != 32 {
                    error!("IDENTITY_HASH_KEY must be 32 bytes (64 hex chars)");
                    std::process::exit(1);
                }
                Some(bytes)
            }
            Err(_) => {
                warn!("IDENTITY_HASH_KEY not set — rate limit keys will use plaintext identity");
                None
            }
        };

        let limiter = RateLimiter::new(RateLimiterConfig {
            requests_per_minute: config.rate_limit_rpm,
            burst_size: config.rate_limit_burst,
            hash_key,
        });

        info!(
            requests_per_minute = config.rate_limit_rpm,
            burst_size = config.rate_limit_burst,
            "rate limiting enabled"
        );

        Some(limiter)
    } else {
        None
    };

    let state = EdgeState::new(&config, rate_limiter).unwrap_or_else(|e| {
        error!(error = %e, "invalid configuration");
        std::process::exit(1);
    });

    // Stale rate-limit buckets — dropped automatically when the runtime shuts down
    if state.rate_limiter.is_some() {
        let cleanup_state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(600));
            loop {
                interval.tick().await;
                if let Some(limiter) = cleanup_state.rate_limiter.as_ref() {
                    limiter.cleanup(Duration::from_secs(1800));
                }
            }
        });
    }

    ws::spawn_liveness_supervisor(state.clone(), config.ping_interval());

    let app = build_router(state.clone());

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        error!(addr, error = %e, "failed to bind");
        std::process::exit(1);
    });

    info!(addr, ws_path = config.ws_path, "edge starting");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "server error");
            std::process::exit(1);
        });

    info!("edge stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }

    spawn_forced_exit();
}

/// In-flight streams can hold graceful shutdown open indefinitely; give
/// them 5 seconds and then leave.
fn spawn_forced_exit() {
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        error!("graceful shutdown timed out, forcing exit");
        std::process::exit(1);
    });
}
