//! Subscriber tracking and the handle returned to transports.

use std::fmt;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::Stream;
use tokio::sync::mpsc;

use super::manager::ChangeNotifier;
use crate::event::ChangeEvent;

/// Opaque identifier of a registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub(crate) u64);

impl SubscriberId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery mechanism a subscriber is connected through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Server-Sent Events stream.
    Sse,
    /// WebSocket channel.
    WebSocket,
    /// In-process consumer.
    Internal,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transport::Sse => "sse",
            Transport::WebSocket => "websocket",
            Transport::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Who is on the other end of a subscription. Used for logging only.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub transport: Transport,
    /// Authenticated user, when the endpoint requires a token.
    pub user_id: Option<String>,
}

impl ClientInfo {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }
}

/// A registry entry for a live subscriber.
#[derive(Debug)]
pub struct SubscriberEntry {
    pub id: SubscriberId,
    pub client: ClientInfo,
    pub(crate) sender: mpsc::Sender<ChangeEvent>,
    pub created_at: Instant,
    /// Number of events queued for this subscriber.
    pub events_sent: u64,
}

impl SubscriberEntry {
    pub(crate) fn new(
        id: SubscriberId,
        client: ClientInfo,
        sender: mpsc::Sender<ChangeEvent>,
    ) -> Self {
        Self {
            id,
            client,
            sender,
            created_at: Instant::now(),
            events_sent: 0,
        }
    }

    /// Get the age of this subscriber.
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn record_event(&mut self) {
        self.events_sent += 1;
    }
}

/// Receiving side of a registered subscriber.
///
/// Yields events in emission order. Dropping the handle (or calling
/// [`Subscription::close`]) deregisters the subscriber; deregistration runs at
/// most once and is a no-op if the notifier already removed the entry after a
/// failed delivery. A closed handle is never reused: reconnecting clients get
/// a new one.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<ChangeEvent>,
    notifier: Weak<ChangeNotifier>,
    released: bool,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriberId,
        receiver: mpsc::Receiver<ChangeEvent>,
        notifier: Weak<ChangeNotifier>,
    ) -> Self {
        Self {
            id,
            receiver,
            notifier,
            released: false,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the notifier dropped this subscriber and every
    /// queued event was received.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    /// Take an already queued event without waiting.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.try_recv().ok()
    }

    /// Deregister now instead of on drop.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.receiver.close();

        if let Some(notifier) = self.notifier.upgrade() {
            notifier.unsubscribe(self.id);
        }
    }
}

impl Stream for Subscription {
    type Item = ChangeEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriber_entry() {
        let (tx, _rx) = mpsc::channel(1);
        let client = ClientInfo::new(Transport::Sse).with_user(Some("user-42".to_string()));
        let entry = SubscriberEntry::new(SubscriberId(1), client, tx);

        assert_eq!(entry.id.as_u64(), 1);
        assert_eq!(entry.client.transport, Transport::Sse);
        assert_eq!(entry.client.user_id.as_deref(), Some("user-42"));
        assert_eq!(entry.events_sent, 0);
    }

    #[test]
    fn test_transport_display() {
        assert_eq!(Transport::Sse.to_string(), "sse");
        assert_eq!(Transport::WebSocket.to_string(), "websocket");
    }

    #[test]
    fn test_orphaned_subscription_drops_cleanly() {
        let (_tx, rx) = mpsc::channel(1);
        let subscription = Subscription::new(SubscriberId(9), rx, Weak::new());
        subscription.close();
    }
}
