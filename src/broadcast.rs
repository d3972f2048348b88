//! Fan-out of newly inserted records to live subscribers (C2).

use crate::record::MessageRecord;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Bound on each subscriber's queue. Crossing it marks the subscriber dead
/// rather than applying backpressure to the publisher.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// A single subscriber's receiving half, returned by [`BroadcastHub::subscribe`].
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<MessageRecord>,
    hub: std::sync::Weak<Inner>,
}

impl Subscription {
    /// Receive the next published record, or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<MessageRecord> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            inner.remove(self.id);
        }
    }
}

struct Inner {
    subscribers: Mutex<Vec<(u64, mpsc::Sender<MessageRecord>)>>,
    next_id: AtomicU64,
}

impl Inner {
    fn remove(&self, id: u64) {
        self.subscribers.lock().unwrap().retain(|(sid, _)| *sid != id);
    }
}

/// Value-owned broadcast hub: publishers call [`publish`](Self::publish),
/// subscribers hold the [`Subscription`] returned by [`subscribe`](Self::subscribe).
///
/// Cloning shares the same underlying subscriber list (it is an `Arc`
/// internally), so the hub can be handed to the capture engine, the wrapper,
/// and every live-API connection handler without any of them owning it
/// exclusively.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: std::sync::Arc<Inner>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(Inner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a new subscriber with a bounded queue.
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.inner.subscribers.lock().unwrap().push((id, tx));
        Subscription { id, rx, hub: std::sync::Arc::downgrade(&self.inner) }
    }

    /// Current live subscriber count, for the status endpoint.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }

    /// Best-effort delivery to every live subscriber. Never blocks: a full
    /// queue or a closed channel drops that subscriber immediately rather
    /// than waiting.
    pub fn publish(&self, record: MessageRecord) {
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        subscribers.retain(|(_, tx)| match tx.try_send(record.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Direction, Peer, TransportType};

    fn sample() -> MessageRecord {
        MessageRecord {
            log_id: "id-1".into(),
            timestamp: chrono::Utc::now(),
            src: Peer { ip: "10.0.0.1".into(), port: Some(1) },
            dst: Peer { ip: "10.0.0.2".into(), port: Some(2) },
            pid: None,
            direction: Direction::Outgoing,
            transport_type: TransportType::Stdio,
            message: r#"{"jsonrpc":"2.0","method":"ping","id":1}"#.into(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_subscribe_and_publish_delivers_record() {
        let hub = BroadcastHub::new();
        let mut sub = hub.subscribe();
        hub.publish(sample());

        let received = sub.recv().await.expect("record delivered");
        assert_eq!(received.log_id, "id-1");
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_multiple_subscribers() {
        let hub = BroadcastHub::new();
        let mut sub1 = hub.subscribe();
        let mut sub2 = hub.subscribe();
        hub.publish(sample());

        assert!(sub1.recv().await.is_some());
        assert!(sub2.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_unsubscribe_on_drop_reduces_count() {
        let hub = BroadcastHub::new();
        assert_eq!(hub.subscriber_count(), 0);
        let sub = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_never_blocks_on_full_subscriber() {
        let hub = BroadcastHub::new();
        let mut sub = hub.subscribe();
        for _ in 0..(SUBSCRIBER_QUEUE_CAPACITY + 10) {
            hub.publish(sample());
        }
        // The slow subscriber should have been dropped once its queue filled.
        assert_eq!(hub.subscriber_count(), 0);
        // Whatever made it into the queue before the drop is still readable.
        assert!(sub.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_publish_with_no_subscribers_does_not_panic() {
        let hub = BroadcastHub::new();
        hub.publish(sample());
    }
}
