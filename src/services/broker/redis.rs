use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use super::{Broker, BrokerError, Delivery, Subscription};

/// Seconds a consumer blocks in `BRPOPLPUSH` before reporting an empty poll.
const BLOCK_TIMEOUT_SECS: u64 = 1;

fn processing_key(queue: &str) -> String {
    format!("{queue}:processing")
}

/// Redis-backed broker: one list per queue, plus a `<queue>:processing` list
/// holding messages that were delivered but not yet acknowledged.
pub struct RedisBroker {
    client: redis::Client,
}

impl RedisBroker {
    pub fn new(redis_url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url).map_err(BrokerError::Redis)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Check Redis connectivity.
    pub async fn health_check(&self) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    /// Number of messages waiting in `queue`.
    pub async fn queue_depth(&self, queue: &str) -> Result<u64, BrokerError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(queue).await?;
        Ok(depth)
    }

    /// Move messages left unacknowledged by a crashed consumer back onto `queue`.
    pub async fn requeue_unacked(&self, queue: &str) -> Result<u64, BrokerError> {
        let mut conn = self.connection().await?;
        let processing = processing_key(queue);
        let mut moved = 0;
        loop {
            let item: Option<Vec<u8>> = conn.rpoplpush(&processing, queue).await?;
            if item.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        // Lists are created on first push; only make sure the server is there.
        self.health_check().await?;
        tracing::debug!(queue, "Queue declared");
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;
        conn.lpush::<_, _, ()>(queue, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let conn = self.connection().await?;
        Ok(Box::new(RedisSubscription {
            client: self.client.clone(),
            conn: Some(conn),
            queue: queue.to_string(),
            processing: processing_key(queue),
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;
        conn.lrem::<_, _, ()>(processing_key(&delivery.queue), 1, delivery.payload.as_slice())
            .await?;
        Ok(())
    }
}

/// Consumer holding its own connection, since `BRPOPLPUSH` blocks it.
struct RedisSubscription {
    client: redis::Client,
    conn: Option<MultiplexedConnection>,
    queue: String,
    processing: String,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, BrokerError> {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                tracing::info!(queue = %self.queue, "Reconnecting subscription");
                self.client.get_multiplexed_async_connection().await?
            }
        };

        // On error the connection is dropped and the next poll opens a fresh one.
        let payload = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue)
            .arg(&self.processing)
            .arg(BLOCK_TIMEOUT_SECS)
            .query_async::<Option<Vec<u8>>>(&mut conn)
            .await?;
        self.conn = Some(conn);

        Ok(payload.map(|payload| Delivery {
            queue: self.queue.clone(),
            payload,
            tag: 0,
        }))
    }
}
