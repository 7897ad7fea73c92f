//! Subscriber registry and change broadcast.
//!
//! [`ChangeNotifier`] is the single authority for "something changed": it owns
//! the last-change timestamp and fans change events out to every registered
//! [`Subscription`].

mod manager;
mod subscription;

pub use manager::{ChangeNotifier, NotifierConfig, SharedNotifier};
pub use subscription::{ClientInfo, SubscriberEntry, SubscriberId, Subscription, Transport};
