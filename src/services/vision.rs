use async_trait::async_trait;

/// Prompt sent alongside every image.
pub const PROMPT: &str = "Describe this image";

/// System instruction for models that accept one.
pub const SYSTEM_PROMPT: &str = concat!(
    "You are an expert multimodal medical imaging assistant trained on medical texts and images. ",
    "Your primary task is to analyze the provided image and patient data ",
    "to generate a structured, objective report. ",
    "CRITICAL RULE: You must NEVER provide definitive diagnoses or treatment recommendations. "
);

/// A multimodal model that turns one image into a text description.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn infer(&self, image: &[u8], mime_type: &str) -> Result<String, ModelError>;
}

/// Upstream failure, classified by whether another attempt could succeed.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Transient model error: {0}")]
    Transient(String),

    #[error("Model rejected the request: {0}")]
    Fatal(String),
}

impl ModelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify an HTTP status returned by a model endpoint.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("HTTP {status}: {body}");
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Self::Transient(message)
        } else {
            Self::Fatal(message)
        }
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transient(format!("HTTP request failed: {e}"))
    }
}
