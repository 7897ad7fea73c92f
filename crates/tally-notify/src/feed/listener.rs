//! Postgres LISTEN/NOTIFY change source.
//!
//! Expects a trigger on each watched table that publishes the changed row on
//! a notification channel, for example:
//!
//! ```sql
//! CREATE OR REPLACE FUNCTION notify_table_change() RETURNS trigger AS $$
//! BEGIN
//!   PERFORM pg_notify('table_changes', json_build_object(
//!     'type', TG_OP, 'table', TG_TABLE_NAME, 'schema', TG_TABLE_SCHEMA,
//!     'record', CASE WHEN TG_OP = 'DELETE' THEN NULL ELSE row_to_json(NEW) END,
//!     'old_record', CASE WHEN TG_OP = 'INSERT' THEN NULL ELSE row_to_json(OLD) END
//!   )::text);
//!   RETURN NULL;
//! END;
//! $$ LANGUAGE plpgsql;
//! ```
//!
//! A statement-level `AFTER TRUNCATE` trigger may send
//! `{"type": "TRUNCATE", "table": ...}` with no rows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ChangeFeedHandle;
use crate::error::{NotifyError, Result};
use crate::event::RowChange;

/// Default notification channel.
pub const DEFAULT_CHANNEL: &str = "table_changes";

/// Default delay before retrying a failed connection.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Listener configuration.
#[derive(Clone)]
pub struct PgListenerConfig {
    /// Postgres connection URL.
    pub database_url: String,
    /// Notification channel to LISTEN on.
    pub channel: String,
    /// Delay before retrying after the connection cannot be established.
    pub reconnect_delay: Duration,
}

impl PgListenerConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            channel: DEFAULT_CHANNEL.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            return Err(NotifyError::Config("database URL is empty".to_string()));
        }
        if self.channel.is_empty() {
            return Err(NotifyError::Config("notification channel is empty".to_string()));
        }
        Ok(())
    }
}

// Keeps the database URL (and its password) out of logs.
impl std::fmt::Debug for PgListenerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgListenerConfig")
            .field("channel", &self.channel)
            .field("reconnect_delay", &self.reconnect_delay)
            .finish_non_exhaustive()
    }
}

/// Whether the listener currently holds an active LISTEN.
#[derive(Debug, Clone, Default)]
pub struct ListenerStatus(Arc<AtomicBool>);

impl ListenerStatus {
    pub fn is_subscribed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self, subscribed: bool) {
        self.0.store(subscribed, Ordering::SeqCst);
    }
}

/// Subscribes once to the notification channel and forwards every payload to
/// the change feed for the lifetime of the process.
///
/// Reconnection after a dropped connection is handled by [`PgListener`]
/// itself; this adapter only tracks whether it is currently subscribed.
pub struct PgChangeListener {
    config: PgListenerConfig,
    feed: ChangeFeedHandle,
    status: ListenerStatus,
}

impl PgChangeListener {
    pub fn new(config: PgListenerConfig, feed: ChangeFeedHandle) -> Self {
        Self {
            config,
            feed,
            status: ListenerStatus::default(),
        }
    }

    /// Get a status handle that stays valid after the listener is spawned.
    pub fn status(&self) -> ListenerStatus {
        self.status.clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.status.is_subscribed()
    }

    /// Run the listener as a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Listen until the change feed processor goes away.
    pub async fn run(self) {
        loop {
            match self.listen().await {
                Ok(()) => {
                    info!("change feed closed, stopping listener");
                    break;
                }
                Err(e) => {
                    self.status.set(false);
                    warn!(
                        error = %e,
                        retry_in_ms = self.config.reconnect_delay.as_millis() as u64,
                        "change feed listener failed"
                    );
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }
        }
        self.status.set(false);
    }

    async fn listen(&self) -> Result<()> {
        let mut listener = PgListener::connect(&self.config.database_url).await?;
        listener.listen(&self.config.channel).await?;
        self.status.set(true);
        info!(channel = %self.config.channel, "subscribed to change feed");

        loop {
            let notification = listener.try_recv().await?;
            let Some(change) = self.on_receive(notification.as_ref().map(|n| n.payload())) else {
                continue;
            };
            if self.feed.send(change).await.is_err() {
                return Ok(());
            }
        }
    }

    /// Handle one `try_recv` result.
    ///
    /// `None` means the connection dropped and `PgListener` has already
    /// reconnected and re-issued LISTEN; a failed reconnect is an error
    /// instead. Either way the listener is subscribed again.
    fn on_receive(&self, payload: Option<&str>) -> Option<RowChange> {
        self.status.set(true);
        match payload {
            Some(payload) => parse_payload(payload),
            None => {
                info!(channel = %self.config.channel, "change feed reconnected");
                None
            }
        }
    }
}

/// Decode a notification payload. An empty payload is a generic change.
fn parse_payload(payload: &str) -> Option<RowChange> {
    if payload.trim().is_empty() {
        return Some(RowChange::default());
    }

    match serde_json::from_str(payload) {
        Ok(change) => Some(change),
        Err(e) => {
            warn!(error = %e, "skipping malformed change notification");
            debug!(payload, "malformed payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RowOperation;

    #[test]
    fn test_parse_trigger_payload() {
        let payload = r#"{"type":"UPDATE","table":"items","schema":"public",
            "record":{"barcode":"4800016","price":32.5},"old_record":{"barcode":"4800016","price":30}}"#;

        let change = parse_payload(payload).unwrap();
        assert_eq!(change.table.as_deref(), Some("items"));
        assert_eq!(change.operation, RowOperation::Update);
        assert_eq!(change.record.unwrap()["price"], 32.5);
    }

    #[test]
    fn test_parse_empty_payload() {
        assert_eq!(parse_payload("  "), Some(RowChange::default()));
    }

    #[test]
    fn test_parse_malformed_payload() {
        assert!(parse_payload("items changed").is_none());
    }

    #[test]
    fn test_config_validation() {
        let config = PgListenerConfig::new("postgres://localhost/tally");
        assert!(config.validate().is_ok());
        assert_eq!(config.channel, DEFAULT_CHANNEL);

        assert!(PgListenerConfig::new("").validate().is_err());
        assert!(PgListenerConfig::new("postgres://localhost/tally")
            .with_channel("")
            .validate()
            .is_err());
    }

    #[test]
    fn test_config_debug_hides_url() {
        let config = PgListenerConfig::new("postgres://admin:hunter2@db/tally");
        assert!(!format!("{:?}", config).contains("hunter2"));
    }

    fn listener() -> PgChangeListener {
        let (tx, _rx) = crate::feed::channel(1);
        PgChangeListener::new(
            PgListenerConfig::new("postgres://localhost/tally"),
            ChangeFeedHandle::new(tx),
        )
    }

    #[test]
    fn test_reconnect_marks_subscribed() {
        let listener = listener();
        let status = listener.status();
        status.set(false);

        assert!(listener.on_receive(None).is_none());
        assert!(status.is_subscribed());
    }

    #[test]
    fn test_notification_marks_subscribed() {
        let listener = listener();
        let status = listener.status();

        let change = listener
            .on_receive(Some(r#"{"type":"INSERT","table":"payments"}"#))
            .unwrap();
        assert_eq!(change.table.as_deref(), Some("payments"));
        assert!(status.is_subscribed());

        status.set(false);
        assert!(listener.on_receive(Some("not json")).is_none());
        assert!(status.is_subscribed());
    }

    #[test]
    fn test_listener_starts_unsubscribed() {
        let (tx, _rx) = crate::feed::channel(1);
        let listener = PgChangeListener::new(
            PgListenerConfig::new("postgres://localhost/tally"),
            ChangeFeedHandle::new(tx),
        );
        let status = listener.status();
        assert!(!listener.is_subscribed());
        assert!(!status.is_subscribed());
    }
}
