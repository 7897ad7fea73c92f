//! Change notifier: subscriber registry, fan-out and last-change timestamp.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use super::subscription::{ClientInfo, SubscriberEntry, SubscriberId, Subscription};
use crate::event::ChangeEvent;
use crate::timestamp::TimestampStore;

/// Default number of undelivered events a subscriber may have queued.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

/// Notifier configuration.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Capacity of each subscriber's delivery queue. A subscriber whose queue
    /// is full when an event is broadcast is dropped.
    pub subscriber_buffer: usize,
}

impl NotifierConfig {
    pub fn with_subscriber_buffer(mut self, size: usize) -> Self {
        self.subscriber_buffer = size.max(1);
        self
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

/// Registry of live subscribers plus the last-change timestamp.
///
/// Both pieces of state tolerate concurrent access; a poller may observe the
/// timestamp slightly before or after a push reaches subscribers.
pub struct ChangeNotifier {
    /// Live subscribers keyed by ID.
    subscribers: DashMap<SubscriberId, SubscriberEntry>,
    /// Next subscriber ID.
    next_subscriber_id: AtomicU64,
    /// In-memory copy of the last-change timestamp. `None` until first set or read.
    last_change_at: RwLock<Option<DateTime<Utc>>>,
    store: Arc<dyn TimestampStore>,
    config: NotifierConfig,
}

impl ChangeNotifier {
    /// Create a notifier, seeding the timestamp from the store.
    ///
    /// A store that cannot be read is treated as never written.
    pub fn new(store: Arc<dyn TimestampStore>, config: NotifierConfig) -> Self {
        let initial = match store.load() {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "failed to load last change timestamp, starting unset");
                None
            }
        };

        debug!(last_change_at = ?initial, "change notifier initialized");

        Self {
            subscribers: DashMap::new(),
            next_subscriber_id: AtomicU64::new(1),
            last_change_at: RwLock::new(initial),
            store,
            config,
        }
    }

    /// Create a shared notifier.
    pub fn shared(store: Arc<dyn TimestampStore>, config: NotifierConfig) -> SharedNotifier {
        Arc::new(Self::new(store, config))
    }

    /// Record that a mutation was committed.
    ///
    /// Moves the timestamp to now (or keeps it if it is already later) and
    /// persists it. Persistence failures are logged and never returned: a
    /// notification problem must not fail the change that triggered it.
    pub fn record_change(&self) -> DateTime<Utc> {
        let now = now_millis();
        let at = {
            let mut guard = self.last_change_at.write();
            let next = guard.map_or(now, |current| current.max(now));
            *guard = Some(next);
            next
        };

        self.persist(at);
        debug!(last_change_at = %at, "change recorded");
        at
    }

    /// Get the last-change timestamp for polling clients.
    ///
    /// Initializes (and persists) it to now on first use.
    pub fn last_change_at(&self) -> DateTime<Utc> {
        if let Some(at) = *self.last_change_at.read() {
            return at;
        }

        let at = {
            let mut guard = self.last_change_at.write();
            match *guard {
                Some(at) => return at,
                None => {
                    let now = now_millis();
                    *guard = Some(now);
                    now
                }
            }
        };

        info!(last_change_at = %at, "last change timestamp initialized");
        self.persist(at);
        at
    }

    /// Queue an event for every live subscriber.
    ///
    /// Never waits on a subscriber. One whose queue is closed or full is
    /// removed; the rest still receive the event. Returns the number of
    /// subscribers the event was queued for.
    pub fn broadcast(&self, event: &ChangeEvent) -> usize {
        if self.subscribers.is_empty() {
            debug!(kind = %event.kind, "broadcast skipped, no subscribers");
            return 0;
        }

        let mut delivered = 0;
        let mut dropped = Vec::new();

        self.subscribers
            .retain(|id, entry| match entry.sender.try_send(event.clone()) {
                Ok(()) => {
                    entry.record_event();
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    dropped.push((*id, "lagging"));
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    dropped.push((*id, "closed"));
                    false
                }
            });

        for (subscriber_id, reason) in &dropped {
            warn!(%subscriber_id, reason, "dropped subscriber during broadcast");
        }

        debug!(
            kind = %event.kind,
            subject = ?event.subject,
            delivered,
            dropped = dropped.len(),
            "broadcast change event"
        );

        delivered
    }

    /// Register a new subscriber.
    pub fn subscribe(self: &Arc<Self>, client: ClientInfo) -> Subscription {
        let id = SubscriberId(self.next_subscriber_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer);

        let transport = client.transport;
        let user_id = client.user_id.clone();
        self.subscribers
            .insert(id, SubscriberEntry::new(id, client, tx));

        info!(
            subscriber_id = %id,
            %transport,
            user_id = ?user_id,
            total = self.subscribers.len(),
            "subscriber connected"
        );

        Subscription::new(id, rx, Arc::downgrade(self))
    }

    /// Remove a subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        match self.subscribers.remove(&id) {
            Some((_, entry)) => {
                info!(
                    subscriber_id = %id,
                    transport = %entry.client.transport,
                    events_sent = entry.events_sent,
                    age_secs = entry.age().as_secs(),
                    total = self.subscribers.len(),
                    "subscriber disconnected"
                );
                true
            }
            None => false,
        }
    }

    /// Drop every subscriber, e.g. on shutdown. Their streams end once the
    /// events already queued are read.
    pub fn disconnect_all(&self) -> usize {
        let count = self.subscribers.len();
        self.subscribers.clear();
        info!(count, "disconnected all subscribers");
        count
    }

    /// Get the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Check whether a subscriber is still registered.
    pub fn is_subscribed(&self, id: SubscriberId) -> bool {
        self.subscribers.contains_key(&id)
    }

    /// Get the configuration.
    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    fn persist(&self, at: DateTime<Utc>) {
        if let Err(e) = self.store.store(at) {
            warn!(error = %e, last_change_at = %at, "failed to persist last change timestamp");
        }
    }
}

/// Shared notifier handle.
pub type SharedNotifier = Arc<ChangeNotifier>;

/// Current time at the precision the store keeps.
fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}
