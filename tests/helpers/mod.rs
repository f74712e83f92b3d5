//! Test helper utilities shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use image_analysis_dispatch::services::analysis::{AnalysisClient, RetryPolicy};
use image_analysis_dispatch::services::broker::{Broker, Delivery, MemoryBroker, Subscription};
use image_analysis_dispatch::services::vision::{ModelError, VisionModel};
use image_analysis_dispatch::services::worker::Worker;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const JOB_QUEUE: &str = "image_analysis";
pub const REPLY_QUEUE: &str = "image_analysis_response";

/// PNG signature; enough for format detection.
pub const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

/// A PNG-looking payload whose tail spells `label`.
pub fn png_with_label(label: &str) -> Vec<u8> {
    let mut bytes = PNG_MAGIC.to_vec();
    bytes.extend_from_slice(label.as_bytes());
    bytes
}

/// Model that "describes" an image by reading back its label.
pub struct EchoModel {
    calls: AtomicU32,
}

impl EchoModel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionModel for EchoModel {
    async fn infer(&self, image: &[u8], mime_type: &str) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let label = String::from_utf8_lossy(&image[PNG_MAGIC.len()..]);
        Ok(format!("{mime_type}: {label}"))
    }
}

/// Model that never answers successfully.
pub struct DownModel;

#[async_trait]
impl VisionModel for DownModel {
    async fn infer(&self, _image: &[u8], _mime_type: &str) -> Result<String, ModelError> {
        Err(ModelError::Transient("503 Service Unavailable".to_string()))
    }
}

/// Analysis client with near-instant retries.
pub fn fast_client(model: Arc<dyn VisionModel>) -> Arc<AnalysisClient> {
    Arc::new(AnalysisClient::new(
        model,
        RetryPolicy::fixed(3, Duration::from_millis(1)),
    ))
}

pub fn shared(broker: &MemoryBroker) -> Arc<dyn Broker> {
    Arc::new(broker.clone())
}

/// Worker on the default queues with near-instant retries.
pub fn worker(broker: &MemoryBroker, model: Arc<dyn VisionModel>) -> Worker {
    Worker::new(shared(broker), fast_client(model), JOB_QUEUE, REPLY_QUEUE)
}

/// Pull exactly `count` deliveries from `subscription`.
pub async fn take(subscription: &mut Box<dyn Subscription>, count: usize) -> Vec<Delivery> {
    let mut deliveries = Vec::with_capacity(count);
    while deliveries.len() < count {
        if let Some(delivery) = subscription.next_delivery().await.expect("subscription failed") {
            deliveries.push(delivery);
        }
    }
    deliveries
}
