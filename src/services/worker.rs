//! Consumer side: turn analysis jobs into correlated responses.
//!
//! A message moves through `received → decoded → analyzed → published → acked`.
//! Decode and analysis failures still produce a published failure response
//! before the ack. A malformed job whose reply address is lost is answered on
//! the worker's default reply queue; only a message without a recoverable
//! correlation id is acked and dropped without a reply. The ack always comes after the response
//! was accepted by the broker, so a crash in between means redelivery, never
//! a lost answer.

use std::sync::Arc;
use std::time::Duration;

use strum::{Display, IntoStaticStr};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::job::{AnalysisResult, AnalysisStatus, FailureKind};
use crate::services::analysis::AnalysisClient;
use crate::services::broker::{Broker, BrokerError, Delivery, Subscription};
use crate::services::codec::{self, CodecError};

/// Pause after a broker error before polling again.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Terminal state of one processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Outcome {
    Answered,
    FailedDecode,
    FailedAnalysis,
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processed {
    pub job_id: Option<Uuid>,
    pub outcome: Outcome,
}

#[derive(Clone)]
pub struct Worker {
    broker: Arc<dyn Broker>,
    analysis: Arc<AnalysisClient>,
    job_queue: String,
    /// Where decode failures go when the job's own `reply_to` is unreadable.
    reply_queue: String,
}

impl Worker {
    pub fn new(
        broker: Arc<dyn Broker>,
        analysis: Arc<AnalysisClient>,
        job_queue: impl Into<String>,
        reply_queue: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            analysis,
            job_queue: job_queue.into(),
            reply_queue: reply_queue.into(),
        }
    }

    /// Run `concurrency` consumer loops until `cancel` fires. Each loop
    /// finishes the message it is working on before exiting.
    pub async fn run(
        &self,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Result<(), WorkerError> {
        self.broker.declare_queue(&self.job_queue).await?;

        let mut consumers = JoinSet::new();
        for consumer in 0..concurrency.max(1) {
            let worker = self.clone();
            let cancel = cancel.clone();
            consumers.spawn(async move { worker.consume(consumer, cancel).await });
        }

        let mut first_error = None;
        while let Some(joined) = consumers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Consumer stopped with error");
                    cancel.cancel();
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Consumer task panicked");
                    cancel.cancel();
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn consume(&self, consumer: usize, cancel: CancellationToken) -> Result<(), WorkerError> {
        let mut subscription = self.broker.subscribe(&self.job_queue).await?;
        tracing::info!(
            consumer,
            queue = %self.job_queue,
            "Consumer ready, starting job processing loop"
        );

        while !cancel.is_cancelled() {
            match self.process_next(subscription.as_mut()).await {
                Ok(Some(processed)) => {
                    tracing::debug!(
                        consumer,
                        outcome = %processed.outcome,
                        "Job processed, checking for next job"
                    );
                }
                Ok(None) => {
                    tracing::trace!(consumer, "No jobs available");
                }
                Err(e) => {
                    tracing::error!(consumer, error = %e, "Error processing job, will retry");
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                    }
                }
            }
        }

        tracing::info!(consumer, "Consumer stopped");
        Ok(())
    }

    /// Process the next job from `subscription`.
    /// Returns `Ok(None)` if no job arrived within the poll window.
    pub async fn process_next(
        &self,
        subscription: &mut dyn Subscription,
    ) -> Result<Option<Processed>, WorkerError> {
        match subscription.next_delivery().await? {
            Some(delivery) => self.handle(&delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Answer and acknowledge one delivery.
    ///
    /// An error means the delivery was not acknowledged and will be handed
    /// out again by the broker.
    pub async fn handle(&self, delivery: &Delivery) -> Result<Processed, WorkerError> {
        let (reply, processed) = match codec::decode_job(&delivery.payload) {
            Ok(job) => {
                tracing::info!(
                    job_id = %job.job_id,
                    mime_type = %job.mime_type,
                    bytes = job.image_payload.len(),
                    "Processing analysis job"
                );

                let analysis = self.analysis.infer(&job.image_payload, &job.mime_type).await;
                let (status, outcome) = match analysis {
                    Ok(analysis_text) => (AnalysisStatus::Ok { analysis_text }, Outcome::Answered),
                    Err(e) => {
                        tracing::warn!(
                            job_id = %job.job_id,
                            kind = %e.kind(),
                            error = %e,
                            "Analysis failed"
                        );
                        (
                            AnalysisStatus::failed(e.kind(), e.to_string()),
                            Outcome::FailedAnalysis,
                        )
                    }
                };

                let result = AnalysisResult {
                    job_id: job.job_id,
                    status,
                };
                (
                    Some((job.reply_to, result)),
                    Processed {
                        job_id: Some(job.job_id),
                        outcome,
                    },
                )
            }
            Err(e) => match e.correlation_id {
                Some(job_id) => {
                    let reply_to = e.reply_to.clone().unwrap_or_else(|| self.reply_queue.clone());
                    tracing::warn!(
                        job_id = %job_id,
                        reply_to = %reply_to,
                        error = %e,
                        "Malformed analysis job"
                    );
                    let result = AnalysisResult {
                        job_id,
                        status: AnalysisStatus::failed(FailureKind::Decode, e.to_string()),
                    };
                    (
                        Some((reply_to, result)),
                        Processed {
                            job_id: Some(job_id),
                            outcome: Outcome::FailedDecode,
                        },
                    )
                }
                None => {
                    tracing::error!(error = %e, "Dropping analysis job without correlation id");
                    (
                        None,
                        Processed {
                            job_id: None,
                            outcome: Outcome::Dropped,
                        },
                    )
                }
            },
        };

        if let Some((reply_to, result)) = reply {
            let payload = codec::encode_result(&result)?;
            self.broker.publish(&reply_to, &payload).await?;
            tracing::info!(
                job_id = %result.job_id,
                reply_to = %reply_to,
                ok = result.status.is_ok(),
                "Analysis response published"
            );
        }

        self.broker.ack(delivery).await?;

        let outcome: &'static str = processed.outcome.into();
        metrics::counter!("analysis_jobs_total", "outcome" => outcome).increment(1);

        Ok(processed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Encoding error: {0}")]
    Codec(#[from] CodecError),
}
