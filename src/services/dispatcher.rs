//! Producer side: publish analysis jobs and hand each caller its own answer.
//!
//! Every [`Dispatcher`] owns one subscription to its reply queue, drained by a
//! single background task. Callers register interest in a job id before the
//! job is published and are released by that task, by their deadline, or by
//! [`Dispatcher::shutdown`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::job::{AnalysisStatus, FailureKind, Job};
use crate::services::broker::{Broker, BrokerError, Subscription};
use crate::services::codec::{self, CodecError};
use crate::services::pending::{Completion, PendingTable, RegisterError, WaitOutcome};

/// Pause after a failed poll of the reply queue before trying again.
const REPLY_RETRY_INTERVAL: Duration = Duration::from_millis(500);

pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    job_queue: String,
    reply_queue: String,
    pending: Arc<PendingTable>,
    shutdown: CancellationToken,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Declare both queues, subscribe to `reply_queue` and start draining it.
    pub async fn start(
        broker: Arc<dyn Broker>,
        job_queue: impl Into<String>,
        reply_queue: impl Into<String>,
    ) -> Result<Self, DispatchError> {
        let job_queue = job_queue.into();
        let reply_queue = reply_queue.into();

        broker.declare_queue(&job_queue).await?;
        broker.declare_queue(&reply_queue).await?;
        let subscription = broker.subscribe(&reply_queue).await?;

        let pending = Arc::new(PendingTable::new());
        let shutdown = CancellationToken::new();
        let drain = tokio::spawn(drain_replies(
            subscription,
            Arc::clone(&broker),
            Arc::clone(&pending),
            shutdown.clone(),
        ));

        tracing::info!(job_queue = %job_queue, reply_queue = %reply_queue, "Dispatcher started");

        Ok(Self {
            broker,
            job_queue,
            reply_queue,
            pending,
            shutdown,
            drain: Mutex::new(Some(drain)),
        })
    }

    /// Publish an analysis job and wait up to `timeout` for its result.
    pub async fn dispatch(
        &self,
        image: Vec<u8>,
        mime_type: &str,
        timeout: Duration,
    ) -> Result<String, DispatchError> {
        let job = Job::new(image, mime_type, self.reply_queue.as_str());
        let job_id = job.job_id;
        let payload = codec::encode_job(&job)?;

        // Registered before publishing so a fast reply always finds its waiter.
        let pending = self.pending.register(job_id, timeout).map_err(|e| match e {
            RegisterError::Closed => DispatchError::Cancelled { job_id },
            RegisterError::Duplicate(job_id) => DispatchError::DuplicateJob { job_id },
        })?;

        self.broker.publish(&self.job_queue, &payload).await?;
        metrics::counter!("dispatch_jobs_total").increment(1);
        tracing::info!(
            job_id = %job_id,
            mime_type,
            bytes = job.image_payload.len(),
            "Analysis job published"
        );

        match pending.wait().await {
            WaitOutcome::Completed(Completion::Answered(AnalysisStatus::Ok { analysis_text })) => {
                tracing::info!(job_id = %job_id, "Analysis result received");
                Ok(analysis_text)
            }
            WaitOutcome::Completed(Completion::Answered(AnalysisStatus::Failed {
                kind,
                reason,
            })) => {
                tracing::warn!(job_id = %job_id, kind = %kind, reason = %reason, "Analysis failed");
                Err(DispatchError::Analysis {
                    job_id,
                    kind,
                    reason,
                })
            }
            WaitOutcome::Completed(Completion::Cancelled) => {
                Err(DispatchError::Cancelled { job_id })
            }
            WaitOutcome::TimedOut => {
                metrics::counter!("dispatch_timeouts_total").increment(1);
                tracing::warn!(
                    job_id = %job_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "No analysis result before deadline"
                );
                Err(DispatchError::Timeout { job_id, timeout })
            }
        }
    }

    /// Publish an analysis job without waiting for its result.
    ///
    /// The eventual reply still arrives on this dispatcher's reply queue and is
    /// discarded as unknown.
    pub async fn submit(&self, image: Vec<u8>, mime_type: &str) -> Result<Uuid, DispatchError> {
        let job = Job::new(image, mime_type, self.reply_queue.as_str());
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::Cancelled { job_id: job.job_id });
        }
        let payload = codec::encode_job(&job)?;
        self.broker.publish(&self.job_queue, &payload).await?;
        tracing::info!(job_id = %job.job_id, "Analysis job submitted");
        Ok(job.job_id)
    }

    /// Number of callers currently waiting.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Release every waiting caller with [`DispatchError::Cancelled`], refuse
    /// further dispatches, and stop draining the reply queue.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let released = self.pending.close();

        let drain = self
            .drain
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(drain) = drain {
            if let Err(e) = drain.await {
                tracing::error!(error = %e, "Reply drain task failed");
            }
        }

        tracing::info!(released, "Dispatcher shut down");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.pending.close();
    }
}

async fn drain_replies(
    mut subscription: Box<dyn Subscription>,
    broker: Arc<dyn Broker>,
    pending: Arc<PendingTable>,
    shutdown: CancellationToken,
) {
    loop {
        // On Redis, a reply already moved to `<reply>:processing` when the
        // poll is dropped here stays there until that list is requeued.
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = subscription.next_delivery() => next,
        };

        match next {
            Ok(Some(delivery)) => {
                route_reply(&pending, &delivery.payload);
                if let Err(e) = broker.ack(&delivery).await {
                    tracing::warn!(error = %e, "Failed to ack analysis response");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, "Error polling reply queue, will retry");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(REPLY_RETRY_INTERVAL) => {}
                }
            }
        }
    }
    tracing::debug!("Reply drain stopped");
}

fn route_reply(pending: &PendingTable, payload: &[u8]) {
    let (job_id, status) = match codec::decode_result(payload) {
        Ok(result) => (result.job_id, result.status),
        Err(e) => match e.correlation_id {
            Some(job_id) => {
                tracing::warn!(job_id = %job_id, error = %e, "Malformed analysis response");
                (job_id, AnalysisStatus::failed(FailureKind::Decode, e.to_string()))
            }
            None => {
                tracing::error!(error = %e, "Dropping analysis response without correlation id");
                return;
            }
        },
    };

    if !pending.complete(job_id, status) {
        tracing::info!(job_id = %job_id, "Discarding response for unknown or expired job");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No analysis result for job {job_id} within {timeout:?}")]
    Timeout { job_id: Uuid, timeout: Duration },

    #[error("Job {job_id} cancelled by dispatcher shutdown")]
    Cancelled { job_id: Uuid },

    #[error("Analysis of job {job_id} failed ({kind}): {reason}")]
    Analysis {
        job_id: Uuid,
        kind: FailureKind,
        reason: String,
    },

    #[error("Job {job_id} is already being awaited")]
    DuplicateJob { job_id: Uuid },

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Encoding error: {0}")]
    Codec(#[from] CodecError),
}

impl DispatchError {
    /// True when the system never answered, as opposed to answering with a failure.
    pub fn is_unanswered(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Cancelled { .. })
    }
}
