//! Send one image for analysis and print the result.
//!
//! Usage: `image-analysis-dispatch <image-path> [mime-type]`

use image_analysis_dispatch::{
    config::AppConfig,
    services::{
        broker::{Broker, RedisBroker},
        dispatcher::Dispatcher,
    },
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(image_path) = args.next() else {
        eprintln!("usage: image-analysis-dispatch <image-path> [mime-type]");
        std::process::exit(2);
    };

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    let image = std::fs::read(&image_path).expect("Failed to read image file");
    let mime_type = args.next().unwrap_or_else(|| {
        image::guess_format(&image)
            .map(|format| format.to_mime_type().to_string())
            .unwrap_or_else(|_| "application/octet-stream".to_string())
    });

    tracing::info!("Connecting to Redis broker");
    let broker: Arc<dyn Broker> =
        Arc::new(RedisBroker::new(&config.redis_url).expect("Failed to initialize broker"));

    let dispatcher = Dispatcher::start(broker, &config.job_queue, &config.reply_queue)
        .await
        .expect("Failed to start dispatcher");

    tracing::info!(
        path = %image_path,
        %mime_type,
        reply_queue = dispatcher.reply_queue(),
        "Sending image, waiting for worker response"
    );
    let result = dispatcher
        .dispatch(image, &mime_type, config.dispatch_timeout())
        .await;
    dispatcher.shutdown().await;

    match result {
        Ok(analysis_text) => println!("{analysis_text}"),
        Err(e) if e.is_unanswered() => {
            eprintln!("No response: {e}. Is a worker running?");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
