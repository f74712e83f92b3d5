//! Image Analysis Dispatch
//!
//! This library moves slow multimodal image analysis off the caller's path:
//! a [`Dispatcher`](services::dispatcher::Dispatcher) publishes jobs to a
//! broker queue, a [`Worker`](services::worker::Worker) runs them through the
//! retrying [`AnalysisClient`](services::analysis::AnalysisClient), and the
//! correlated response is routed back to the caller that is waiting for it.

pub mod config;
pub mod models;
pub mod services;
