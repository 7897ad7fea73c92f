//! Gateway configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use tally_notify::feed::{DEFAULT_FEED_BUFFER, PgListenerConfig};
use tally_notify::notifier::NotifierConfig;
use tally_notify::ChangeFeedConfig;

/// Default listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";

/// Default front-end origin allowed by CORS.
pub const DEFAULT_ALLOWED_ORIGIN: &str = "http://localhost:5173";

/// Tally gateway command line arguments.
#[derive(Debug, Parser)]
#[command(name = "tally-gateway")]
#[command(version, about = "Live-update gateway for the Tally back office")]
pub struct Args {
    /// Address to listen on for HTTP requests.
    #[arg(short, long, env = "TALLY_LISTEN", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: String,

    /// Directory for the last-change timestamp store.
    #[arg(short, long, env = "TALLY_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Postgres URL for the LISTEN/NOTIFY change feed. Without it only the
    /// webhook feeds changes.
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// Notification channel the change triggers publish on.
    #[arg(long, env = "TALLY_NOTIFY_CHANNEL", default_value = "table_changes")]
    pub notify_channel: String,

    /// Tables whose changes are broadcast (comma-separated, empty = all).
    #[arg(long, env = "TALLY_WATCH_TABLES", value_delimiter = ',')]
    pub watch_tables: Vec<String>,

    /// Origins allowed by CORS (comma-separated, `*` for any).
    #[arg(
        long,
        env = "TALLY_ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_value = DEFAULT_ALLOWED_ORIGIN
    )]
    pub allowed_origins: Vec<String>,

    /// HMAC secret for session tokens. When set, subscription endpoints
    /// require a bearer token.
    #[arg(long, env = "TALLY_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Shared secret the change-feed webhook must send in `x-webhook-secret`.
    #[arg(long, env = "TALLY_WEBHOOK_SECRET", hide_env_values = true)]
    pub webhook_secret: Option<String>,

    /// Interval (s) between SSE keep-alive comments.
    #[arg(long, env = "TALLY_KEEP_ALIVE_SECS", default_value_t = 15)]
    pub keep_alive_secs: u64,

    /// Events a subscriber may have queued before it is dropped.
    #[arg(long, env = "TALLY_SUBSCRIBER_BUFFER", default_value_t = 64)]
    pub subscriber_buffer: usize,

    /// Capacity of the change feed queue.
    #[arg(long, env = "TALLY_FEED_BUFFER", default_value_t = DEFAULT_FEED_BUFFER)]
    pub feed_buffer: usize,

    /// Delay (ms) before retrying a failed change feed connection.
    #[arg(long, env = "TALLY_RECONNECT_DELAY_MS", default_value_t = 2_000)]
    pub reconnect_delay_ms: u64,

    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG.
    #[arg(long, env = "TALLY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address {0:?}")]
    ListenAddr(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("notification channel is empty")]
    EmptyChannel,

    #[error("at least one allowed origin is required")]
    NoOrigins,
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to listen on for HTTP requests.
    pub listen_addr: String,
    /// Directory for the last-change timestamp store.
    pub data_dir: PathBuf,
    /// Postgres URL for the change feed listener.
    pub database_url: Option<String>,
    /// Notification channel to LISTEN on.
    pub notify_channel: String,
    /// Tables whose changes are broadcast. Empty means all.
    pub watch_tables: Vec<String>,
    /// Origins allowed by CORS.
    pub allowed_origins: Vec<String>,
    /// HMAC secret for session tokens.
    pub jwt_secret: Option<String>,
    /// Shared secret for the webhook.
    pub webhook_secret: Option<String>,
    /// Interval between SSE keep-alive comments.
    pub keep_alive: Duration,
    /// Per-subscriber queue capacity.
    pub subscriber_buffer: usize,
    /// Change feed queue capacity.
    pub feed_buffer: usize,
    /// Delay before retrying a failed feed connection.
    pub reconnect_delay: Duration,
}

impl From<Args> for GatewayConfig {
    fn from(args: Args) -> Self {
        Self {
            listen_addr: args.listen,
            data_dir: args.data_dir,
            database_url: args.database_url.filter(|url| !url.is_empty()),
            notify_channel: args.notify_channel,
            watch_tables: clean_list(args.watch_tables),
            allowed_origins: clean_list(args.allowed_origins),
            jwt_secret: args.jwt_secret.filter(|secret| !secret.is_empty()),
            webhook_secret: args.webhook_secret.filter(|secret| !secret.is_empty()),
            keep_alive: Duration::from_secs(args.keep_alive_secs),
            subscriber_buffer: args.subscriber_buffer,
            feed_buffer: args.feed_buffer,
            reconnect_delay: Duration::from_millis(args.reconnect_delay_ms),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            data_dir: PathBuf::from("./data"),
            database_url: None,
            notify_channel: "table_changes".to_string(),
            watch_tables: Vec::new(),
            allowed_origins: vec![DEFAULT_ALLOWED_ORIGIN.to_string()],
            jwt_secret: None,
            webhook_secret: None,
            keep_alive: Duration::from_secs(15),
            subscriber_buffer: 64,
            feed_buffer: DEFAULT_FEED_BUFFER,
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

impl GatewayConfig {
    /// Require bearer tokens on subscription endpoints.
    pub fn with_jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.jwt_secret = Some(secret.into());
        self
    }

    /// Require a shared secret on the webhook.
    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    /// Restrict broadcasts to the given tables.
    pub fn with_watch_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.watch_tables = tables.into_iter().map(Into::into).collect();
        self
    }

    /// Check the configuration before starting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::ListenAddr(self.listen_addr.clone()));
        }
        if self.subscriber_buffer == 0 {
            return Err(ConfigError::Zero("subscriber_buffer"));
        }
        if self.feed_buffer == 0 {
            return Err(ConfigError::Zero("feed_buffer"));
        }
        if self.keep_alive.is_zero() {
            return Err(ConfigError::Zero("keep_alive_secs"));
        }
        if self.database_url.is_some() && self.notify_channel.trim().is_empty() {
            return Err(ConfigError::EmptyChannel);
        }
        if self.allowed_origins.is_empty() {
            return Err(ConfigError::NoOrigins);
        }
        Ok(())
    }

    /// Path of the timestamp store inside the data directory.
    pub fn status_store_path(&self) -> PathBuf {
        self.data_dir.join("status")
    }

    pub fn notifier_config(&self) -> NotifierConfig {
        NotifierConfig::default().with_subscriber_buffer(self.subscriber_buffer)
    }

    pub fn feed_config(&self) -> ChangeFeedConfig {
        ChangeFeedConfig::default()
            .with_watched_tables(self.watch_tables.iter().cloned())
            .with_buffer_size(self.feed_buffer)
    }

    /// Listener configuration, if a database URL is set.
    pub fn listener_config(&self) -> Option<PgListenerConfig> {
        self.database_url.as_ref().map(|url| {
            PgListenerConfig::new(url.clone())
                .with_channel(self.notify_channel.clone())
                .with_reconnect_delay(self.reconnect_delay)
        })
    }
}

/// Trim entries and drop empty ones.
fn clean_list(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}
