//! Upstream change feed.
//!
//! Row changes arrive from the database (a LISTEN/NOTIFY channel or a webhook)
//! and are queued on a [`ChangeFeedHandle`]. A single background
//! [`ChangeFeedProcessor`] turns each change on a watched table into a
//! timestamp update followed by a broadcast, so the feed is the only thing
//! that ever triggers notifications. A submitter that needs the recorded
//! timestamp uses [`ChangeFeedHandle::try_submit`] and awaits the reply.

mod listener;

pub use listener::{ListenerStatus, PgChangeListener, PgListenerConfig};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::SendError, error::TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::event::RowChange;
use crate::notifier::SharedNotifier;

/// Default capacity of the change queue.
pub const DEFAULT_FEED_BUFFER: usize = 256;

/// Change feed configuration.
#[derive(Debug, Clone)]
pub struct ChangeFeedConfig {
    /// Tables whose changes are broadcast. Empty means every table.
    pub watched_tables: Vec<String>,
    /// Capacity of the change queue.
    pub buffer_size: usize,
}

impl ChangeFeedConfig {
    pub fn with_watched_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.watched_tables = tables.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    /// Check whether a change on `table` should be broadcast.
    ///
    /// Changes with no table are always broadcast.
    pub fn is_watched(&self, table: Option<&str>) -> bool {
        match table {
            Some(table) => {
                self.watched_tables.is_empty() || self.watched_tables.iter().any(|t| t == table)
            }
            None => true,
        }
    }
}

impl Default for ChangeFeedConfig {
    fn default() -> Self {
        Self {
            watched_tables: Vec::new(),
            buffer_size: DEFAULT_FEED_BUFFER,
        }
    }
}

/// A queued change.
#[derive(Debug)]
pub struct FeedItem {
    pub change: RowChange,
    /// Receives the last-change timestamp once the change is processed.
    reply: Option<oneshot::Sender<DateTime<Utc>>>,
}

impl FeedItem {
    pub fn new(change: RowChange) -> Self {
        Self {
            change,
            reply: None,
        }
    }

    fn with_reply(change: RowChange) -> (Self, oneshot::Receiver<DateTime<Utc>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                change,
                reply: Some(tx),
            },
            rx,
        )
    }
}

impl From<RowChange> for FeedItem {
    fn from(change: RowChange) -> Self {
        Self::new(change)
    }
}

/// Processor that bridges the change feed to the notifier.
pub struct ChangeFeedProcessor {
    rx: mpsc::Receiver<FeedItem>,
    notifier: SharedNotifier,
    config: ChangeFeedConfig,
}

impl ChangeFeedProcessor {
    pub fn new(
        rx: mpsc::Receiver<FeedItem>,
        notifier: SharedNotifier,
        config: ChangeFeedConfig,
    ) -> Self {
        Self {
            rx,
            notifier,
            config,
        }
    }

    /// Process changes until every handle is dropped.
    pub async fn run(mut self) {
        info!(
            watched_tables = ?self.config.watched_tables,
            "change feed processor started"
        );

        while let Some(item) = self.rx.recv().await {
            let recorded = self.process(item.change);
            if let Some(reply) = item.reply {
                // Unwatched changes report the current timestamp unchanged.
                let at = recorded.unwrap_or_else(|| self.notifier.last_change_at());
                if reply.send(at).is_err() {
                    debug!("change submitter went away before the reply");
                }
            }
        }

        info!("change feed processor stopped (channel closed)");
    }

    /// Handle one change. Returns the recorded timestamp if it was broadcast.
    fn process(&self, change: RowChange) -> Option<DateTime<Utc>> {
        if !self.config.is_watched(change.table.as_deref()) {
            debug!(table = ?change.table, "ignoring change on unwatched table");
            return None;
        }

        debug!(
            table = ?change.table,
            operation = ?change.operation,
            "processing row change"
        );

        let at = self.notifier.record_change();
        self.notifier.broadcast(&change.into_event());
        Some(at)
    }
}

/// Sender half of the change queue.
pub type ChangeFeedSender = mpsc::Sender<FeedItem>;

/// Create a new change queue with the given buffer size.
pub fn channel(buffer_size: usize) -> (ChangeFeedSender, mpsc::Receiver<FeedItem>) {
    mpsc::channel(buffer_size)
}

/// Cloneable handle for submitting changes to a running processor.
#[derive(Clone)]
pub struct ChangeFeedHandle {
    tx: ChangeFeedSender,
}

impl ChangeFeedHandle {
    pub fn new(tx: ChangeFeedSender) -> Self {
        Self { tx }
    }

    /// Submit a change without waiting. Fails if the queue is full or the
    /// processor has stopped.
    pub fn try_send(&self, change: RowChange) -> Result<(), TrySendError<RowChange>> {
        self.tx.try_send(FeedItem::new(change)).map_err(into_change)
    }

    /// Submit a change without waiting and get a receiver for the timestamp
    /// recorded for it. Fails like [`ChangeFeedHandle::try_send`].
    pub fn try_submit(
        &self,
        change: RowChange,
    ) -> Result<oneshot::Receiver<DateTime<Utc>>, TrySendError<RowChange>> {
        let (item, reply) = FeedItem::with_reply(change);
        self.tx.try_send(item).map_err(into_change)?;
        Ok(reply)
    }

    /// Submit a change, waiting if the queue is full.
    pub async fn send(&self, change: RowChange) -> Result<(), SendError<RowChange>> {
        self.tx
            .send(FeedItem::new(change))
            .await
            .map_err(|SendError(item)| SendError(item.change))
    }

    /// Check whether the processor is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

fn into_change(e: TrySendError<FeedItem>) -> TrySendError<RowChange> {
    match e {
        TrySendError::Full(item) => TrySendError::Full(item.change),
        TrySendError::Closed(item) => TrySendError::Closed(item.change),
    }
}

/// Spawn a processor and return a handle for feeding it.
pub fn start_processor(notifier: SharedNotifier, config: ChangeFeedConfig) -> ChangeFeedHandle {
    let (tx, rx) = channel(config.buffer_size);
    let processor = ChangeFeedProcessor::new(rx, notifier, config);

    tokio::spawn(async move {
        processor.run().await;
    });

    ChangeFeedHandle::new(tx)
}
