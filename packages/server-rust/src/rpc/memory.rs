//! In-process broker implementing [`Transport`].
//!
//! Queues are unbounded channels shared by competing consumers. Every queue
//! keeps counters so tests can assert on publishes and acks. Publishing to
//! an undeclared queue drops the message, the way a broker's default
//! exchange drops unroutable messages. An auto-delete queue goes away when
//! its last consumer stream is dropped.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::transport::{
    Acknowledger, ConsumeOptions, Delivery, DeliveryStream, QueueOptions, Transport,
    TransportError,
};

/// Counters for one queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub published: u64,
    pub acked: u64,
}

#[derive(Debug)]
struct MemoryQueue {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Bytes>>>,
    auto_delete: bool,
    consumers: AtomicUsize,
    published: AtomicU64,
    acked: AtomicU64,
}

impl MemoryQueue {
    fn new(options: QueueOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            auto_delete: options.auto_delete,
            consumers: AtomicUsize::new(0),
            published: AtomicU64::new(0),
            acked: AtomicU64::new(0),
        }
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            published: self.published.load(Ordering::SeqCst),
            acked: self.acked.load(Ordering::SeqCst),
        }
    }
}

/// In-memory broker. Cheap to clone; clones share the same queues.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Debug, Default)]
struct BrokerInner {
    queues: DashMap<String, Arc<MemoryQueue>>,
    unroutable: AtomicU64,
    failing_publishes: AtomicU32,
    closed: AtomicBool,
    /// Cancelled to end every open consumer stream.
    consumers_alive: SyncMutex<CancellationToken>,
}

impl BrokerInner {
    fn delete_if_same(&self, name: &str, queue: &Arc<MemoryQueue>) {
        if self
            .queues
            .remove_if(name, |_, current| Arc::ptr_eq(current, queue))
            .is_some()
        {
            debug!(queue = name, "auto-delete queue removed");
        }
    }
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` publishes fail with `TransportError::Publish`.
    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Ends every open consumer stream, the way a dropped broker connection
    /// does. Auto-delete queues that had consumers are deleted with them.
    pub fn sever_consumers(&self) {
        let token = std::mem::replace(
            &mut *self.inner.consumers_alive.lock(),
            CancellationToken::new(),
        );
        token.cancel();
        self.inner
            .queues
            .retain(|_, queue| !(queue.auto_delete && queue.consumers.load(Ordering::SeqCst) > 0));
    }

    /// Counters for a queue, or `None` if it does not exist.
    #[must_use]
    pub fn stats(&self, queue: &str) -> Option<QueueStats> {
        self.inner.queues.get(queue).map(|q| q.stats())
    }

    /// Number of messages dropped because their destination did not exist.
    #[must_use]
    pub fn unroutable_count(&self) -> u64 {
        self.inner.unroutable.load(Ordering::SeqCst)
    }

    /// Publishes raw bytes, bypassing envelope encoding. Useful for feeding
    /// malformed frames to a consumer.
    ///
    /// # Errors
    ///
    /// Same as [`Transport::publish`].
    pub async fn publish_raw(&self, destination: &str, body: &[u8]) -> Result<(), TransportError> {
        self.publish(destination, Bytes::copy_from_slice(body)).await
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.inner
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Registration of one consumer stream on a queue. Dropping the last one
/// deletes an auto-delete queue.
struct ConsumerGuard {
    broker: Arc<BrokerInner>,
    name: String,
    queue: Arc<MemoryQueue>,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        let remaining = self.queue.consumers.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && self.queue.auto_delete {
            self.broker.delete_if_same(&self.name, &self.queue);
        }
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn declare(&self, queue: &str, options: QueueOptions) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.inner
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new(options)));
        Ok(())
    }

    async fn publish(&self, destination: &str, body: Bytes) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.take_injected_failure() {
            return Err(TransportError::Publish {
                destination: destination.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let Some(queue) = self.inner.queues.get(destination).map(|q| q.value().clone()) else {
            self.inner.unroutable.fetch_add(1, Ordering::SeqCst);
            debug!(destination, "dropping unroutable message");
            return Ok(());
        };

        queue.published.fetch_add(1, Ordering::SeqCst);
        queue.tx.send(body).map_err(|_| TransportError::Publish {
            destination: destination.to_string(),
            reason: "queue receiver dropped".to_string(),
        })
    }

    async fn consume(
        &self,
        source: &str,
        _options: ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError> {
        self.ensure_open()?;
        let queue = self
            .inner
            .queues
            .get(source)
            .map(|q| q.value().clone())
            .ok_or_else(|| TransportError::UnknownQueue {
                queue: source.to_string(),
            })?;
        queue.consumers.fetch_add(1, Ordering::SeqCst);
        let guard = ConsumerGuard {
            broker: Arc::clone(&self.inner),
            name: source.to_string(),
            queue,
        };
        let severed = self.inner.consumers_alive.lock().clone().cancelled_owned();

        let deliveries = stream::unfold(guard, |guard| async move {
            if guard.broker.closed.load(Ordering::SeqCst) {
                return None;
            }
            let body = guard.queue.rx.lock().await.recv().await?;
            let acker = MemoryAcker {
                queue: Arc::clone(&guard.queue),
            };
            let delivery = Delivery::new(body, false, Box::new(acker));
            Some((Ok(delivery), guard))
        });

        Ok(deliveries.take_until(severed).boxed())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.consumers_alive.lock().cancel();
        Ok(())
    }
}

/// Settles a memory delivery against its queue's counters.
struct MemoryAcker {
    queue: Arc<MemoryQueue>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.queue.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ConsumeOptions {
        ConsumeOptions::new("test", 1)
    }

    #[tokio::test]
    async fn publish_then_consume_and_ack() {
        let broker = MemoryBroker::new();
        broker.declare("q", QueueOptions::request_queue()).await.unwrap();
        broker.publish("q", Bytes::from_static(b"hello")).await.unwrap();

        let mut stream = broker.consume("q", opts()).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(&delivery.body[..], b"hello");
        assert!(!delivery.redelivered);
        delivery.ack().await.unwrap();

        let stats = broker.stats("q").unwrap();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.acked, 1);
    }

    #[tokio::test]
    async fn unroutable_messages_are_dropped() {
        let broker = MemoryBroker::new();
        broker.publish("nowhere", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(broker.unroutable_count(), 1);
    }

    #[tokio::test]
    async fn consume_undeclared_queue_fails() {
        let broker = MemoryBroker::new();
        let err = broker.consume("missing", opts()).await.err().unwrap();
        assert!(matches!(err, TransportError::UnknownQueue { .. }));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let broker = MemoryBroker::new();
        broker.declare("q", QueueOptions::request_queue()).await.unwrap();
        broker.fail_next_publishes(2);

        assert!(broker.publish("q", Bytes::new()).await.is_err());
        assert!(broker.publish("q", Bytes::new()).await.is_err());
        assert!(broker.publish("q", Bytes::new()).await.is_ok());
    }

    #[tokio::test]
    async fn competing_consumers_split_messages() {
        let broker = MemoryBroker::new();
        broker.declare("q", QueueOptions::request_queue()).await.unwrap();
        for i in 0..4u8 {
            broker.publish("q", Bytes::from(vec![i])).await.unwrap();
        }

        let mut a = broker.consume("q", opts()).await.unwrap();
        let mut b = broker.consume("q", opts()).await.unwrap();
        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(a.next().await.unwrap().unwrap().body[0]);
            seen.push(b.next().await.unwrap().unwrap().body[0]);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn auto_delete_queue_goes_with_its_last_consumer() {
        let broker = MemoryBroker::new();
        broker.declare("replies", QueueOptions::reply_queue()).await.unwrap();

        let first = broker.consume("replies", opts()).await.unwrap();
        let second = broker.consume("replies", opts()).await.unwrap();
        drop(first);
        assert!(broker.stats("replies").is_some());

        drop(second);
        assert!(broker.stats("replies").is_none());
    }

    #[tokio::test]
    async fn auto_delete_queue_without_consumers_stays() {
        let broker = MemoryBroker::new();
        broker.declare("replies", QueueOptions::reply_queue()).await.unwrap();
        broker.declare("requests", QueueOptions::request_queue()).await.unwrap();
        drop(broker.consume("requests", opts()).await.unwrap());

        assert!(broker.stats("replies").is_some());
        assert!(broker.stats("requests").is_some());
    }

    #[tokio::test]
    async fn severed_consumers_end_and_lose_auto_delete_queues() {
        let broker = MemoryBroker::new();
        broker.declare("replies", QueueOptions::reply_queue()).await.unwrap();
        broker.declare("requests", QueueOptions::request_queue()).await.unwrap();
        let mut replies = broker.consume("replies", opts()).await.unwrap();
        let mut requests = broker.consume("requests", opts()).await.unwrap();

        broker.sever_consumers();
        assert!(replies.next().await.is_none());
        assert!(requests.next().await.is_none());
        assert!(broker.stats("replies").is_none());
        assert!(broker.stats("requests").is_some());

        // Re-declaring restores a consumable queue; the stale stream's drop
        // must not delete it again.
        broker.declare("replies", QueueOptions::reply_queue()).await.unwrap();
        let mut fresh = broker.consume("replies", opts()).await.unwrap();
        drop(replies);
        broker.publish("replies", Bytes::from_static(b"r")).await.unwrap();
        assert_eq!(&fresh.next().await.unwrap().unwrap().body[..], b"r");
    }

    #[tokio::test]
    async fn closed_broker_rejects_operations_and_ends_streams() {
        let broker = MemoryBroker::new();
        broker.declare("q", QueueOptions::request_queue()).await.unwrap();
        let mut stream = broker.consume("q", opts()).await.unwrap();

        broker.close().await.unwrap();
        assert!(stream.next().await.is_none());
        let err = broker
            .declare("q", QueueOptions::request_queue())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
