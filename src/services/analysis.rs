//! Bounded-retry wrapper around the external vision model.
//!
//! This is the only place upstream failures are absorbed: callers receive
//! either the analysis text or an [`AnalysisError`] that already says whether
//! the input, the attempt budget, or the model itself was the problem.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::models::job::FailureKind;
use crate::services::vision::{ModelError, VisionModel};

/// How long to wait between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every failure.
    Fixed(Duration),
    /// `base`, doubling after each failure, never above `max`.
    Exponential { base: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Randomize each delay into `[nominal / 2, nominal]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(1), Duration::from_secs(8))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(delay),
            jitter: false,
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential { base, max },
            jitter: true,
        }
    }

    /// Nominal delay after the `failed_attempt`-th failure (1-based).
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(failed_attempt.saturating_sub(1));
                base.saturating_mul(factor).min(max)
            }
        }
    }

    fn sleep_for(&self, failed_attempt: u32) -> Duration {
        let nominal = self.delay_for(failed_attempt);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }
        let half = nominal / 2;
        let extra_ms = rand::rng().random_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(extra_ms)
    }
}

/// Analysis client shared by every consumer loop of a worker.
pub struct AnalysisClient {
    model: Arc<dyn VisionModel>,
    policy: RetryPolicy,
}

impl AnalysisClient {
    pub fn new(model: Arc<dyn VisionModel>, policy: RetryPolicy) -> Self {
        Self { model, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Describe `image`, retrying transient upstream failures.
    pub async fn infer(&self, image: &[u8], mime_type: &str) -> Result<String, AnalysisError> {
        let result = self.infer_with_retries(image, mime_type).await;
        if let Err(e) = &result {
            let kind: &'static str = e.kind().into();
            metrics::counter!("analysis_failures_total", "kind" => kind).increment(1);
        }
        result
    }

    async fn infer_with_retries(
        &self,
        image: &[u8],
        mime_type: &str,
    ) -> Result<String, AnalysisError> {
        validate_image(image, mime_type)?;

        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            metrics::counter!("analysis_attempts_total").increment(1);
            let start = Instant::now();

            match self.model.infer(image, mime_type).await {
                Ok(text) => {
                    metrics::histogram!("analysis_duration_seconds")
                        .record(start.elapsed().as_secs_f64());
                    tracing::debug!(attempt, bytes = image.len(), "Analysis succeeded");
                    return Ok(text);
                }
                Err(ModelError::Fatal(reason)) => {
                    tracing::error!(attempt, error = %reason, "Model rejected analysis request");
                    return Err(AnalysisError::Rejected(reason));
                }
                Err(ModelError::Transient(reason)) => {
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        error = %reason,
                        "Analysis attempt failed"
                    );
                    last_error = reason;
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.policy.sleep_for(attempt)).await;
            }
        }

        tracing::error!(
            attempts = max_attempts,
            error = %last_error,
            "Analysis failed after all attempts"
        );
        Err(AnalysisError::Exhausted {
            attempts: max_attempts,
            last_error,
        })
    }
}

/// Reject payloads no model could make sense of.
///
/// Content is only sniffed for formats the `image` crate can identify. Other
/// `image/*` types, such as HEIC, are passed through to the model.
pub fn validate_image(image: &[u8], mime_type: &str) -> Result<(), AnalysisError> {
    if image.is_empty() {
        return Err(AnalysisError::Input("image payload is empty".to_string()));
    }
    if !mime_type.starts_with("image/") {
        return Err(AnalysisError::Input(format!(
            "unsupported mime type {mime_type:?}"
        )));
    }
    if image::ImageFormat::from_mime_type(mime_type).is_some() {
        image::guess_format(image).map_err(|_| {
            AnalysisError::Input("payload is not a recognizable image".to_string())
        })?;
    }
    Ok(())
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AnalysisError {
    #[error("Invalid image input: {0}")]
    Input(String),

    #[error("Analysis failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("Model rejected the request: {0}")]
    Rejected(String),
}

impl AnalysisError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Input(_) => FailureKind::Input,
            Self::Exhausted { .. } => FailureKind::TransientExternal,
            Self::Rejected(_) => FailureKind::Rejected,
        }
    }
}
