//! Wire format for messages travelling over the broker.
//!
//! Both directions use a JSON envelope split into `metadata` (correlation
//! identity and routing) and `payload` (the job body or its outcome). Image
//! bytes are base64-encoded so the envelope stays text-safe on any transport.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{AnalysisResult, AnalysisStatus, Job};

#[derive(Serialize, Deserialize)]
struct RequestEnvelope<'a> {
    metadata: RequestMetadata<'a>,
    payload: RequestPayload<'a>,
}

#[derive(Serialize, Deserialize)]
struct RequestMetadata<'a> {
    correlation_id: Uuid,
    reply_to: Cow<'a, str>,
    published_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct RequestPayload<'a> {
    #[serde(with = "base64_bytes")]
    image_bytes: Cow<'a, [u8]>,
    mime_type: Cow<'a, str>,
}

#[derive(Serialize, Deserialize)]
struct ResponseEnvelope<'a> {
    metadata: ResponseMetadata,
    payload: Cow<'a, AnalysisStatus>,
}

#[derive(Serialize, Deserialize)]
struct ResponseMetadata {
    correlation_id: Uuid,
    published_at: DateTime<Utc>,
}

/// Encode a job as a request envelope.
pub fn encode_job(job: &Job) -> Result<Vec<u8>, CodecError> {
    let envelope = RequestEnvelope {
        metadata: RequestMetadata {
            correlation_id: job.job_id,
            reply_to: Cow::Borrowed(&job.reply_to),
            published_at: Utc::now(),
        },
        payload: RequestPayload {
            image_bytes: Cow::Borrowed(&job.image_payload),
            mime_type: Cow::Borrowed(&job.mime_type),
        },
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Decode a request envelope back into a job.
///
/// On failure the error still carries whatever correlation identity could be
/// read from the raw JSON, so the worker can answer with a failure response.
pub fn decode_job(raw: &[u8]) -> Result<Job, DecodeError> {
    match serde_json::from_slice::<RequestEnvelope>(raw) {
        Ok(envelope) => Ok(Job {
            job_id: envelope.metadata.correlation_id,
            image_payload: envelope.payload.image_bytes.into_owned(),
            mime_type: envelope.payload.mime_type.into_owned(),
            reply_to: envelope.metadata.reply_to.into_owned(),
        }),
        Err(source) => Err(DecodeError::recover(raw, source)),
    }
}

/// Encode an analysis result as a response envelope.
pub fn encode_result(result: &AnalysisResult) -> Result<Vec<u8>, CodecError> {
    let envelope = ResponseEnvelope {
        metadata: ResponseMetadata {
            correlation_id: result.job_id,
            published_at: Utc::now(),
        },
        payload: Cow::Borrowed(&result.status),
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Decode a response envelope.
pub fn decode_result(raw: &[u8]) -> Result<AnalysisResult, DecodeError> {
    match serde_json::from_slice::<ResponseEnvelope>(raw) {
        Ok(envelope) => Ok(AnalysisResult {
            job_id: envelope.metadata.correlation_id,
            status: envelope.payload.into_owned(),
        }),
        Err(source) => Err(DecodeError::recover(raw, source)),
    }
}

mod base64_bytes {
    use std::borrow::Cow;

    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, 'a, D>(deserializer: D) -> Result<Cow<'a, [u8]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = <Cow<'de, str>>::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(Cow::Owned)
            .map_err(serde::de::Error::custom)
    }
}

/// A message that could not be decoded.
#[derive(Debug, thiserror::Error)]
#[error("Malformed envelope: {source}")]
pub struct DecodeError {
    #[source]
    pub source: serde_json::Error,
    /// Correlation identifier, if the metadata section was still readable.
    pub correlation_id: Option<Uuid>,
    /// Reply queue, if the metadata section was still readable.
    pub reply_to: Option<String>,
}

impl DecodeError {
    fn recover(raw: &[u8], source: serde_json::Error) -> Self {
        let value: Option<serde_json::Value> = serde_json::from_slice(raw).ok();
        let metadata = value.as_ref().and_then(|v| v.get("metadata"));

        let correlation_id = metadata
            .and_then(|m| m.get("correlation_id"))
            .and_then(|id| id.as_str())
            .and_then(|id| Uuid::parse_str(id).ok());
        let reply_to = metadata
            .and_then(|m| m.get("reply_to"))
            .and_then(|r| r.as_str())
            .filter(|r| !r.is_empty())
            .map(str::to_string);

        Self {
            source,
            correlation_id,
            reply_to,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
