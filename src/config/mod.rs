use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::services::analysis::RetryPolicy;
use crate::services::gemini::GeminiClient;
use crate::services::vision::VisionModel;
use crate::services::workers_ai::WorkersAiClient;

/// Which hosted model backs the analysis client.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisProvider {
    Gemini,
    WorkersAi,
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Redis connection string for the broker
    pub redis_url: String,

    /// Queue jobs are published to
    #[serde(default = "default_job_queue")]
    pub job_queue: String,

    /// Queue this dispatcher listens on for responses
    #[serde(default = "default_reply_queue")]
    pub reply_queue: String,

    #[serde(default = "default_provider")]
    pub analysis_provider: AnalysisProvider,

    /// Google AI API key (Gemini provider)
    pub gemini_api_key: Option<String>,

    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,

    /// Cloudflare account ID (Workers AI provider)
    pub cf_account_id: Option<String>,

    /// Cloudflare Workers AI API token
    pub cf_api_token: Option<String>,

    /// Attempts per analysis, including the first
    #[serde(default = "default_max_attempts")]
    pub analysis_max_attempts: u32,

    /// First retry delay; doubles per failure up to `analysis_max_backoff_ms`
    #[serde(default = "default_backoff_ms")]
    pub analysis_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub analysis_max_backoff_ms: u64,

    /// Use a constant delay between attempts instead of exponential backoff
    #[serde(default)]
    pub analysis_fixed_backoff: bool,

    /// How long a dispatcher waits for a response
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,

    /// Consumer loops per worker process
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Return messages left unacknowledged by a crashed worker to the queue at startup
    #[serde(default)]
    pub worker_recover_unacked: bool,

    /// Prometheus scrape address for the worker (e.g., "0.0.0.0:9000")
    pub metrics_addr: Option<String>,
}

fn default_job_queue() -> String {
    "image_analysis".to_string()
}

fn default_reply_queue() -> String {
    "image_analysis_response".to_string()
}

fn default_provider() -> AnalysisProvider {
    AnalysisProvider::Gemini
}

fn default_gemini_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    8000
}

fn default_dispatch_timeout_secs() -> u64 {
    120
}

fn default_worker_concurrency() -> usize {
    1
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Ok(envy::from_env()?)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let base = Duration::from_millis(self.analysis_backoff_ms);
        if self.analysis_fixed_backoff {
            RetryPolicy::fixed(self.analysis_max_attempts, base)
        } else {
            RetryPolicy::exponential(
                self.analysis_max_attempts,
                base,
                Duration::from_millis(self.analysis_max_backoff_ms),
            )
        }
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    /// Build the configured vision model. Called once at process start.
    pub fn vision_model(&self) -> Result<Arc<dyn VisionModel>, ConfigError> {
        match self.analysis_provider {
            AnalysisProvider::Gemini => {
                let api_key = self
                    .gemini_api_key
                    .clone()
                    .ok_or(ConfigError::Missing("GEMINI_API_KEY"))?;
                Ok(Arc::new(GeminiClient::new(api_key, self.gemini_model.clone())))
            }
            AnalysisProvider::WorkersAi => {
                let account_id = self
                    .cf_account_id
                    .clone()
                    .ok_or(ConfigError::Missing("CF_ACCOUNT_ID"))?;
                let api_token = self
                    .cf_api_token
                    .clone()
                    .ok_or(ConfigError::Missing("CF_API_TOKEN"))?;
                Ok(Arc::new(WorkersAiClient::new(account_id, api_token)))
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid environment: {0}")]
    Env(#[from] envy::Error),

    #[error("{0} must be set for the selected analysis provider")]
    Missing(&'static str),
}
