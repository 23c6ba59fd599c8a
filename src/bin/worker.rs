use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use lmbridge::config::{init_tracing, WorkerConfig};
use lmbridge::worker::{health, Connection};

#[tokio::main]
async fn main() {
    let config = WorkerConfig::parse();

    init_tracing(&config.log_level, &config.log_format);

    let (connection, status) = Connection::new(&config).unwrap_or_else(|e| {
        error!(error = %e, "invalid configuration");
        std::process::exit(1);
    });

    // Local health endpoint
    let health_addr = format!("0.0.0.0:{}", config.health_check_port);
    let health_listener = TcpListener::bind(&health_addr).await.unwrap_or_else(|e| {
        error!(addr = health_addr, error = %e, "failed to bind health endpoint");
        std::process::exit(1);
    });
    info!(addr = health_addr, "health endpoint starting");
    let health_status = status.clone();
    tokio::spawn(async move {
        if let Err(e) = health::serve(health_listener, health_status).await {
            error!(error = %e, "health endpoint error");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
        // In-flight upstream calls can hold shutdown open; give them
        // 5 seconds and then leave.
        tokio::time::sleep(Duration::from_secs(5)).await;
        error!("graceful shutdown timed out, forcing exit");
        std::process::exit(1);
    });

    connection.run(shutdown_rx).await;

    info!("worker stopped");
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
}
