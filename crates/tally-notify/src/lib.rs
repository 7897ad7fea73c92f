//! Tally change notification core.
//!
//! This crate provides the state behind the back office's live-update channel:
//! a registry of connected subscribers with per-subscriber delivery queues, the
//! persisted last-change timestamp that polling clients read, and the adapter
//! that turns upstream row-level change events into notifications.

pub mod auth;
pub mod error;
pub mod event;
pub mod feed;
pub mod notifier;
pub mod timestamp;

pub use auth::{AuthError, JwtVerifier, TokenVerifier, UserIdentity};
pub use error::{NotifyError, Result};
pub use event::{ChangeEvent, EventKind, RowChange, RowOperation};
pub use feed::{
    start_processor, ChangeFeedConfig, ChangeFeedHandle, ChangeFeedProcessor, FeedItem,
    ListenerStatus, PgChangeListener, PgListenerConfig,
};
pub use notifier::{
    ChangeNotifier, ClientInfo, NotifierConfig, SharedNotifier, SubscriberId, Subscription,
    Transport,
};
pub use timestamp::{SledTimestampStore, TimestampStore};
