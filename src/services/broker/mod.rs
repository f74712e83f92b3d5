//! Minimal publish/subscribe interface over the message transport.
//!
//! Queues are point-to-point: every published message is delivered to one
//! subscriber of the queue, and stays owned by the broker until that
//! subscriber acknowledges it.

pub mod memory;
pub mod redis;

use async_trait::async_trait;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

/// A message handed to a subscriber, not yet acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub payload: Vec<u8>,
    /// Broker-assigned handle used to acknowledge this delivery.
    pub tag: u64,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Make sure `queue` exists. Idempotent.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Hand `payload` to the broker. Returns once the broker has accepted it.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Start consuming from `queue`.
    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError>;

    /// Acknowledge a delivery so it is not handed out again.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery.
    ///
    /// Returns `Ok(None)` when nothing arrived within the subscription's poll
    /// window, so callers get a regular chance to observe shutdown.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, BrokerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Broker closed")]
    Closed,

    #[error("Unknown delivery {tag} on queue {queue}")]
    UnknownDelivery { queue: String, tag: u64 },
}
