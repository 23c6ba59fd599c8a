use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing::warn;

use crate::protocol::{RequestKind, RequestMode};

/// Floor for the liveness sweep interval.
const MIN_PING_INTERVAL_MS: u64 = 1_000;

/// Edge process configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "lmbridge-edge", version, about = "Public edge of the LM Studio bridge")]
pub struct EdgeConfig {
    /// HTTP listen port
    #[arg(long, default_value_t = 3000, env = "PORT")]
    pub port: u16,

    /// Bind address
    #[arg(long, default_value = "0.0.0.0", env = "HOST")]
    pub host: String,

    /// Shared secret workers authenticate with (required)
    #[arg(long, env = "API_KEY")]
    pub api_key: Option<String>,

    /// Secret used to sign worker bearer tokens (required)
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// Worker token lifetime in seconds
    #[arg(long, default_value_t = 86_400, env = "JWT_EXPIRES_IN")]
    pub jwt_expires_in: u64,

    /// Path workers connect to for the WebSocket upgrade
    #[arg(long, default_value = "/ws", env = "WS_PATH")]
    pub ws_path: String,

    /// Liveness sweep interval in milliseconds (min 1000)
    #[arg(long, default_value_t = 30_000, env = "WS_PING_INTERVAL_MS")]
    pub ws_ping_interval_ms: u64,

    /// Serve streaming requests as SSE; when false, stream:true requests
    /// are transparently handled unary
    #[arg(long, default_value_t = true, env = "ENABLE_STREAMING", action = clap::ArgAction::Set)]
    pub enable_streaming: bool,

    /// Deadline for models requests, milliseconds
    #[arg(long, default_value_t = 10_000, env = "MODELS_TIMEOUT_MS")]
    pub models_timeout_ms: u64,

    /// Deadline for unary chat/completion requests, milliseconds
    #[arg(long, default_value_t = 60_000, env = "REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: u64,

    /// Deadline for embeddings requests, milliseconds
    #[arg(long, default_value_t = 30_000, env = "EMBEDDINGS_TIMEOUT_MS")]
    pub embeddings_timeout_ms: u64,

    /// Deadline for streaming requests, milliseconds
    #[arg(long, default_value_t = 300_000, env = "STREAM_TIMEOUT_MS")]
    pub stream_timeout_ms: u64,

    /// Requests per minute per identity (0 to disable rate limiting)
    #[arg(long, default_value_t = 0, env = "RATE_LIMIT_RPM")]
    pub rate_limit_rpm: u32,

    /// Rate limit burst size
    #[arg(long, default_value_t = 10, env = "RATE_LIMIT_BURST")]
    pub rate_limit_burst: u32,

    /// Log level: debug, info, warn or error
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    pub log_level: String,

    /// Log format: "text" or "json"
    #[arg(long, default_value = "text", env = "LOG_FORMAT")]
    pub log_format: String,
}

impl EdgeConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Liveness sweep interval, clamped to the 1 s floor.
    pub fn ping_interval(&self) -> Duration {
        let ms = if self.ws_ping_interval_ms < MIN_PING_INTERVAL_MS {
            warn!(
                configured = self.ws_ping_interval_ms,
                min = MIN_PING_INTERVAL_MS,
                "WS_PING_INTERVAL_MS below minimum, clamping"
            );
            MIN_PING_INTERVAL_MS
        } else {
            self.ws_ping_interval_ms
        };
        Duration::from_millis(ms)
    }

    /// Per-request deadline by kind and mode.
    pub fn deadline_for(&self, kind: RequestKind, mode: RequestMode) -> Duration {
        let ms = match (kind, mode) {
            (_, RequestMode::Stream) => self.stream_timeout_ms,
            (RequestKind::Models, _) => self.models_timeout_ms,
            (RequestKind::Embeddings, _) => self.embeddings_timeout_ms,
            (RequestKind::Chat | RequestKind::Completion, _) => self.request_timeout_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Worker process configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "lmbridge-worker", version, about = "LM Studio worker of the bridge")]
pub struct WorkerConfig {
    /// WebSocket URL of the edge, e.g. ws://edge.example:3000/ws (required)
    #[arg(long, env = "REMOTE_SERVER_URL")]
    pub remote_server_url: Option<String>,

    /// Shared secret to authenticate with (required)
    #[arg(long, env = "API_KEY")]
    pub api_key: Option<String>,

    /// Unique id this worker registers under (required)
    #[arg(long, env = "CLIENT_ID")]
    pub client_id: Option<String>,

    /// LM Studio host
    #[arg(long, default_value = "localhost", env = "LM_STUDIO_HOST")]
    pub lm_studio_host: String,

    /// LM Studio port
    #[arg(long, default_value_t = 1234, env = "LM_STUDIO_PORT")]
    pub lm_studio_port: u16,

    /// Local health endpoint port
    #[arg(long, default_value_t = 3001, env = "HEALTH_CHECK_PORT")]
    pub health_check_port: u16,

    /// Delay between reconnect attempts, milliseconds
    #[arg(long, default_value_t = 5_000, env = "RECONNECT_INTERVAL")]
    pub reconnect_interval: u64,

    /// Upstream timeout for unary requests, seconds
    #[arg(long, default_value_t = 300, env = "UPSTREAM_TIMEOUT_SECS")]
    pub upstream_timeout_secs: u64,

    /// Upstream timeout for streaming requests, seconds
    #[arg(long, default_value_t = 600, env = "UPSTREAM_STREAM_TIMEOUT_SECS")]
    pub upstream_stream_timeout_secs: u64,

    /// Log level: debug, info, warn or error
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    pub log_level: String,

    /// Log format: "text" or "json"
    #[arg(long, default_value = "text", env = "LOG_FORMAT")]
    pub log_format: String,
}

impl WorkerConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval)
    }
}

/// Invalid or incomplete configuration; fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("API_KEY is required")]
    MissingApiKey,

    #[error("JWT_SECRET is required")]
    MissingJwtSecret,

    #[error("REMOTE_SERVER_URL is required")]
    MissingRemoteUrl,

    #[error("CLIENT_ID is required")]
    MissingClientId,

    #[error("invalid REMOTE_SERVER_URL: {0}")]
    InvalidRemoteUrl(String),

    #[error("WS_PATH must start with '/'")]
    InvalidWsPath,

    #[error("invalid LM Studio address: {0}")]
    InvalidUpstream(String),
}

/// Configure the global tracing subscriber.
pub fn init_tracing(log_level: &str, log_format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match log_format {
        "json" => {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge_config() -> EdgeConfig {
        EdgeConfig::parse_from(["lmbridge-edge", "--api-key", "k", "--jwt-secret", "s"])
    }

    #[test]
    fn test_edge_defaults() {
        let config = edge_config();
        assert_eq!(config.port, 3000);
        assert_eq!(config.ws_path, "/ws");
        assert_eq!(config.ws_ping_interval_ms, 30_000);
        assert!(config.enable_streaming);
        assert_eq!(config.rate_limit_rpm, 0);
    }

    #[test]
    fn test_listen_addr() {
        let mut config = edge_config();
        config.host = "127.0.0.1".into();
        config.port = 8080;
        assert_eq!(config.listen_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_ping_interval_clamped() {
        let mut config = edge_config();
        config.ws_ping_interval_ms = 50;
        assert_eq!(config.ping_interval(), Duration::from_millis(1_000));

        config.ws_ping_interval_ms = 2_000;
        assert_eq!(config.ping_interval(), Duration::from_millis(2_000));
    }

    #[test]
    fn test_deadline_by_kind() {
        let config = edge_config();
        assert_eq!(
            config.deadline_for(RequestKind::Models, RequestMode::Unary),
            Duration::from_secs(10)
        );
        assert_eq!(
            config.deadline_for(RequestKind::Chat, RequestMode::Unary),
            Duration::from_secs(60)
        );
        assert_eq!(
            config.deadline_for(RequestKind::Embeddings, RequestMode::Unary),
            Duration::from_secs(30)
        );
        assert_eq!(
            config.deadline_for(RequestKind::Chat, RequestMode::Stream),
            Duration::from_secs(300)
        );
        assert_eq!(
            config.deadline_for(RequestKind::Completion, RequestMode::Stream),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_streaming_flag_parses_false() {
        let config = EdgeConfig::parse_from([
            "lmbridge-edge",
            "--api-key",
            "k",
            "--jwt-secret",
            "s",
            "--enable-streaming",
            "false",
        ]);
        assert!(!config.enable_streaming);
    }

    #[test]
    fn test_worker_defaults() {
        let config = WorkerConfig::parse_from(["lmbridge-worker"]);
        assert_eq!(config.lm_studio_host, "localhost");
        assert_eq!(config.lm_studio_port, 1234);
        assert_eq!(config.health_check_port, 3001);
        assert_eq!(config.reconnect_interval(), Duration::from_secs(5));
    }
}
