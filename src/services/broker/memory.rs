use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{Broker, BrokerError, Delivery, Subscription};

const DEFAULT_POLL_WINDOW: Duration = Duration::from_millis(250);

/// In-process broker with the same ack semantics as the Redis one.
///
/// Used for tests and for running dispatcher and worker inside one process.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    queues: Mutex<HashMap<String, QueueState>>,
    next_tag: AtomicU64,
    closed: AtomicBool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Vec<u8>>,
    unacked: HashMap<u64, Vec<u8>>,
    notify: Arc<Notify>,
}

impl Shared {
    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop accepting publishes and subscriptions.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }

    /// Messages waiting to be delivered.
    pub fn ready_len(&self, queue: &str) -> usize {
        self.shared.queues().get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet acknowledged.
    pub fn unacked_len(&self, queue: &str) -> usize {
        self.shared.queues().get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Put every unacknowledged message back at the front of its queue, as a
    /// broker does when a consumer disappears.
    pub fn requeue_unacked(&self, queue: &str) -> usize {
        let mut queues = self.shared.queues();
        let Some(state) = queues.get_mut(queue) else {
            return 0;
        };

        let mut tags: Vec<u64> = state.unacked.keys().copied().collect();
        tags.sort_unstable();
        let count = tags.len();
        for tag in tags.into_iter().rev() {
            if let Some(payload) = state.unacked.remove(&tag) {
                state.ready.push_front(payload);
            }
        }
        state.notify.notify_waiters();
        count
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.shared.check_open()?;
        self.shared.queues().entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.shared.check_open()?;
        let mut queues = self.shared.queues();
        let state = queues.entry(queue.to_string()).or_default();
        state.ready.push_back(payload.to_vec());
        state.notify.notify_one();
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        self.declare_queue(queue).await?;
        Ok(Box::new(MemorySubscription {
            shared: Arc::clone(&self.shared),
            queue: queue.to_string(),
            poll_window: DEFAULT_POLL_WINDOW,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut queues = self.shared.queues();
        queues
            .get_mut(&delivery.queue)
            .and_then(|state| state.unacked.remove(&delivery.tag))
            .map(|_| ())
            .ok_or_else(|| BrokerError::UnknownDelivery {
                queue: delivery.queue.clone(),
                tag: delivery.tag,
            })
    }
}

struct MemorySubscription {
    shared: Arc<Shared>,
    queue: String,
    poll_window: Duration,
}

impl MemorySubscription {
    fn try_take(&self) -> Result<Result<Delivery, Arc<Notify>>, BrokerError> {
        self.shared.check_open()?;
        let mut queues = self.shared.queues();
        let state = queues.entry(self.queue.clone()).or_default();

        match state.ready.pop_front() {
            Some(payload) => {
                let tag = self.shared.next_tag.fetch_add(1, Ordering::Relaxed);
                state.unacked.insert(tag, payload.clone());
                Ok(Ok(Delivery {
                    queue: self.queue.clone(),
                    payload,
                    tag,
                }))
            }
            None => Ok(Err(Arc::clone(&state.notify))),
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, BrokerError> {
        let notify = match self.try_take()? {
            Ok(delivery) => return Ok(Some(delivery)),
            Err(notify) => notify,
        };

        if tokio::time::timeout(self.poll_window, notify.notified()).await.is_err() {
            return Ok(None);
        }
        Ok(self.try_take()?.ok())
    }
}
