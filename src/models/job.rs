use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};
use uuid::Uuid;

/// An image analysis job as published by a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub job_id: Uuid,
    pub image_payload: Vec<u8>,
    pub mime_type: String,
    /// Queue the worker publishes the correlated response to.
    pub reply_to: String,
}

impl Job {
    pub fn new(
        image_payload: Vec<u8>,
        mime_type: impl Into<String>,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            image_payload,
            mime_type: mime_type.into(),
            reply_to: reply_to.into(),
        }
    }
}

/// Why an analysis produced no text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, IntoStaticStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// The request envelope could not be decoded by the worker.
    Decode,
    /// Empty or unreadable image; never retried.
    Input,
    /// The upstream model kept failing until the attempt budget ran out.
    TransientExternal,
    /// The upstream model refused the request outright.
    Rejected,
}

/// Outcome of one analysis as carried back to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisStatus {
    Ok { analysis_text: String },
    Failed { kind: FailureKind, reason: String },
}

impl AnalysisStatus {
    pub fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            reason: reason.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// A worker's answer to one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisResult {
    pub job_id: Uuid,
    pub status: AnalysisStatus,
}
