//! Message transport binding: the narrow broker surface the RPC layer needs.
//!
//! A transport declares queues, publishes raw frames to a named queue, and
//! hands out restartable streams of deliveries. Each delivery carries its own
//! acknowledger so the consumer decides when to settle it.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures raised by a transport binding.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("publish to `{destination}` failed: {reason}")]
    Publish { destination: String, reason: String },
    #[error("consume from `{source_queue}` failed: {reason}")]
    Consume { source_queue: String, reason: String },
    #[error("queue `{queue}` is not declared")]
    UnknownQueue { queue: String },
    #[error("delivery settlement failed: {0}")]
    Settle(String),
    #[error("transport is closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Properties of a declared queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survive a broker restart.
    pub durable: bool,
    /// Delete the queue once its last consumer goes away.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Long-lived request queue shared by all responders.
    #[must_use]
    pub fn request_queue() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }

    /// Per-client reply queue that disappears with its client.
    #[must_use]
    pub fn reply_queue() -> Self {
        Self {
            durable: false,
            auto_delete: true,
        }
    }
}

/// Options for a consumer subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Tag identifying the consumer on the broker.
    pub consumer_tag: String,
    /// Maximum number of unacknowledged deliveries handed to this consumer.
    pub prefetch: u16,
}

impl ConsumeOptions {
    #[must_use]
    pub fn new(consumer_tag: impl Into<String>, prefetch: u16) -> Self {
        Self {
            consumer_tag: consumer_tag.into(),
            prefetch,
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Confirms the delivery; the broker forgets it.
    async fn ack(&self) -> Result<(), TransportError>;
}

/// A message handed to a consumer, together with its acknowledger.
pub struct Delivery {
    pub body: Bytes,
    /// `true` when the broker has handed this message out before.
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    #[must_use]
    pub fn new(body: Bytes, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            body,
            redelivered,
            acker,
        }
    }

    /// Acknowledges the delivery.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Settle` if the broker refuses the ack.
    pub async fn ack(self) -> Result<(), TransportError> {
        self.acker.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from one subscription. Ends when the subscription
/// is cancelled or the underlying channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Broker primitives consumed by the RPC client and server.
///
/// Implementations must be safe to call concurrently from many tasks;
/// publishing from one task never waits on another task's consumer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Declares a queue. Declaring an existing queue is a no-op.
    async fn declare(&self, queue: &str, options: QueueOptions) -> Result<(), TransportError>;

    /// Publishes a frame to the named queue.
    async fn publish(&self, destination: &str, body: Bytes) -> Result<(), TransportError>;

    /// Subscribes to a queue. Calling again after the stream ends restarts
    /// consumption (reconnecting first if needed).
    async fn consume(
        &self,
        source: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError>;

    /// Releases the broker connection. Further calls fail with `Closed`.
    async fn close(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    struct CountingAcker {
        acks: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Acknowledger for CountingAcker {
        async fn ack(&self) -> Result<(), TransportError> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivery_forwards_ack_to_acker() {
        let acks = Arc::new(AtomicU32::new(0));
        let delivery = Delivery::new(
            Bytes::from_static(b"x"),
            true,
            Box::new(CountingAcker { acks: acks.clone() }),
        );
        assert!(delivery.redelivered);

        delivery.ack().await.unwrap();
        assert_eq!(acks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queue_option_presets() {
        assert!(QueueOptions::request_queue().durable);
        assert!(QueueOptions::reply_queue().auto_delete);
    }
}
