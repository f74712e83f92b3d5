use image_analysis_dispatch::{
    config::AppConfig,
    services::{
        analysis::AnalysisClient,
        broker::{Broker, RedisBroker},
        worker::Worker,
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting image analysis worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Prometheus scrape endpoint, when requested
    if let Some(addr) = &config.metrics_addr {
        let addr: SocketAddr = addr.parse().expect("Invalid METRICS_ADDR");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus exporter");
        tracing::info!(%addr, "Serving metrics");
    }

    metrics::describe_counter!("analysis_jobs_total", "Analysis jobs handled, by outcome");
    metrics::describe_counter!("analysis_attempts_total", "Calls made to the vision model");
    metrics::describe_counter!(
        "analysis_failures_total",
        "Analysis calls that ended in failure, by kind"
    );
    metrics::describe_histogram!(
        "analysis_duration_seconds",
        "Latency of successful vision model calls"
    );
    metrics::describe_gauge!("analysis_queue_depth", "Jobs waiting in the analysis queue");

    // Connect to the broker
    tracing::info!("Connecting to Redis broker");
    let broker =
        Arc::new(RedisBroker::new(&config.redis_url).expect("Failed to initialize broker"));
    broker.health_check().await.expect("Redis is not reachable");

    if config.worker_recover_unacked {
        let moved = broker
            .requeue_unacked(&config.job_queue)
            .await
            .expect("Failed to recover unacknowledged jobs");
        tracing::info!(moved, "Returned unacknowledged jobs to the queue");
    }

    // Initialize the vision model once and share it
    tracing::info!(provider = ?config.analysis_provider, "Initializing vision model client");
    let model = config.vision_model().expect("Failed to initialize vision model");
    let analysis = Arc::new(AnalysisClient::new(model, config.retry_policy()));
    tracing::info!(
        max_attempts = analysis.policy().max_attempts,
        backoff = ?analysis.policy().backoff,
        "Analysis retry policy"
    );

    let worker = Worker::new(
        broker.clone() as Arc<dyn Broker>,
        analysis,
        config.job_queue.clone(),
        config.reply_queue.clone(),
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested, finishing in-flight jobs");
                cancel.cancel();
            }
        }
    });

    tokio::spawn({
        let broker = broker.clone();
        let queue = config.job_queue.clone();
        let cancel = cancel.clone();
        async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(15));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match broker.queue_depth(&queue).await {
                            Ok(depth) => metrics::gauge!("analysis_queue_depth").set(depth as f64),
                            Err(e) => tracing::warn!(error = %e, "Failed to read queue depth"),
                        }
                    }
                }
            }
        }
    });

    tracing::info!(
        concurrency = config.worker_concurrency,
        queue = %config.job_queue,
        "Worker ready"
    );

    if let Err(e) = worker.run(config.worker_concurrency, cancel).await {
        tracing::error!(error = %e, "Worker stopped with error");
        std::process::exit(1);
    }

    tracing::info!("Worker stopped");
}
