//! Dispatcher, broker and worker wired together in one process.
//!
//! Run with: cargo test --test dispatch_flow_test

mod helpers;

use helpers::*;
use image_analysis_dispatch::models::job::{AnalysisResult, AnalysisStatus, FailureKind, Job};
use image_analysis_dispatch::services::broker::{Broker, MemoryBroker};
use image_analysis_dispatch::services::codec;
use image_analysis_dispatch::services::dispatcher::{DispatchError, Dispatcher};
use image_analysis_dispatch::services::worker::Outcome;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_dispatch_round_trip_through_worker() {
    let broker = MemoryBroker::new();
    let model = EchoModel::new();
    let worker = worker(&broker, model.clone());

    let cancel = CancellationToken::new();
    let running = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.run(2, cancel).await }
    });

    let dispatcher = Arc::new(
        Dispatcher::start(shared(&broker), JOB_QUEUE, REPLY_QUEUE)
            .await
            .unwrap(),
    );

    let callers: Vec<_> = (0..8)
        .map(|i| {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                let text = dispatcher
                    .dispatch(
                        png_with_label(&format!("xray-{i}")),
                        "image/png",
                        Duration::from_secs(5),
                    )
                    .await
                    .unwrap();
                (i, text)
            })
        })
        .collect();

    for joined in futures::future::join_all(callers).await {
        let (i, text) = joined.unwrap();
        assert_eq!(text, format!("image/png: xray-{i}"));
    }
    assert_eq!(model.calls(), 8);
    assert_eq!(dispatcher.pending_count(), 0);

    cancel.cancel();
    running.await.unwrap().unwrap();
    dispatcher.shutdown().await;

    assert_eq!(broker.unacked_len(JOB_QUEUE), 0);
    assert_eq!(broker.ready_len(REPLY_QUEUE), 0);
}

#[tokio::test]
async fn test_exhausted_analysis_reaches_caller_as_failure() {
    let broker = MemoryBroker::new();
    let worker = worker(&broker, Arc::new(DownModel));
    let cancel = CancellationToken::new();
    let running = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.run(1, cancel).await }
    });

    let dispatcher = Dispatcher::start(shared(&broker), JOB_QUEUE, REPLY_QUEUE)
        .await
        .unwrap();
    let err = dispatcher
        .dispatch(png_with_label("chest"), "image/png", Duration::from_secs(5))
        .await
        .unwrap_err();

    match err {
        DispatchError::Analysis { kind, reason, .. } => {
            assert_eq!(kind, FailureKind::TransientExternal);
            assert!(reason.contains("3 attempts"), "{reason}");
        }
        other => panic!("expected analysis failure, got {other:?}"),
    }

    cancel.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_empty_image_fails_without_model_call() {
    let broker = MemoryBroker::new();
    let model = EchoModel::new();
    let worker = worker(&broker, model.clone());
    let cancel = CancellationToken::new();
    let running = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.run(1, cancel).await }
    });

    let dispatcher = Dispatcher::start(shared(&broker), JOB_QUEUE, REPLY_QUEUE)
        .await
        .unwrap();
    let err = dispatcher
        .dispatch(Vec::new(), "image/png", Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::Analysis { kind: FailureKind::Input, .. }));
    assert_eq!(model.calls(), 0);

    cancel.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_redelivered_job_gets_equivalent_response() {
    let broker = MemoryBroker::new();
    let worker = worker(&broker, EchoModel::new());

    let job = Job::new(png_with_label("knee"), "image/png", REPLY_QUEUE);
    let payload = codec::encode_job(&job).unwrap();
    broker.publish(JOB_QUEUE, &payload).await.unwrap();
    broker.publish(JOB_QUEUE, &payload).await.unwrap();

    let mut jobs = broker.subscribe(JOB_QUEUE).await.unwrap();
    for delivery in take(&mut jobs, 2).await {
        let processed = worker.handle(&delivery).await.unwrap();
        assert_eq!(processed.job_id, Some(job.job_id));
        assert_eq!(processed.outcome, Outcome::Answered);
    }

    let mut replies = broker.subscribe(REPLY_QUEUE).await.unwrap();
    let responses: Vec<AnalysisResult> = take(&mut replies, 2)
        .await
        .iter()
        .map(|d| codec::decode_result(&d.payload).unwrap())
        .collect();

    assert_eq!(responses[0], responses[1]);
    assert_eq!(responses[0].job_id, job.job_id);
    assert!(responses[0].status.is_ok());
}

#[tokio::test]
async fn test_malformed_job_with_identity_gets_decode_failure() {
    let broker = MemoryBroker::new();
    let worker = worker(&broker, EchoModel::new());

    let job_id = uuid::Uuid::new_v4();
    let raw = serde_json::json!({
        "metadata": { "correlation_id": job_id, "reply_to": REPLY_QUEUE },
        "payload": { "mime_type": "image/png" }
    });
    broker.publish(JOB_QUEUE, raw.to_string().as_bytes()).await.unwrap();

    let mut jobs = broker.subscribe(JOB_QUEUE).await.unwrap();
    let processed = worker.process_next(jobs.as_mut()).await.unwrap().unwrap();
    assert_eq!(processed.outcome, Outcome::FailedDecode);
    assert_eq!(broker.unacked_len(JOB_QUEUE), 0);

    let mut replies = broker.subscribe(REPLY_QUEUE).await.unwrap();
    let reply = codec::decode_result(&take(&mut replies, 1).await[0].payload).unwrap();
    assert_eq!(reply.job_id, job_id);
    assert!(matches!(reply.status, AnalysisStatus::Failed { kind: FailureKind::Decode, .. }));
}

#[tokio::test]
async fn test_malformed_job_without_reply_to_answers_on_default_reply_queue() {
    let broker = MemoryBroker::new();
    let worker = worker(&broker, EchoModel::new());

    let job_id = uuid::Uuid::new_v4();
    let raw = serde_json::json!({
        "metadata": { "correlation_id": job_id },
        "payload": { "image_bytes": "!!", "mime_type": "image/png" }
    });
    broker.publish(JOB_QUEUE, raw.to_string().as_bytes()).await.unwrap();

    let mut jobs = broker.subscribe(JOB_QUEUE).await.unwrap();
    let processed = worker.process_next(jobs.as_mut()).await.unwrap().unwrap();
    assert_eq!(processed.job_id, Some(job_id));
    assert_eq!(processed.outcome, Outcome::FailedDecode);
    assert_eq!(broker.unacked_len(JOB_QUEUE), 0);

    let mut replies = broker.subscribe(REPLY_QUEUE).await.unwrap();
    let reply = codec::decode_result(&take(&mut replies, 1).await[0].payload).unwrap();
    assert_eq!(reply.job_id, job_id);
    assert!(matches!(reply.status, AnalysisStatus::Failed { kind: FailureKind::Decode, .. }));
}

#[tokio::test]
async fn test_unidentifiable_job_is_dropped() {
    let broker = MemoryBroker::new();
    let worker = worker(&broker, EchoModel::new());
    broker.publish(JOB_QUEUE, b"not json at all").await.unwrap();

    let mut jobs = broker.subscribe(JOB_QUEUE).await.unwrap();
    let processed = worker.process_next(jobs.as_mut()).await.unwrap().unwrap();

    assert_eq!(processed.outcome, Outcome::Dropped);
    assert_eq!(broker.unacked_len(JOB_QUEUE), 0);
    assert_eq!(broker.ready_len(REPLY_QUEUE), 0);
}

#[tokio::test]
async fn test_job_stays_unacked_when_reply_cannot_be_published() {
    let broker = MemoryBroker::new();
    let worker = worker(&broker, EchoModel::new());
    let job = Job::new(png_with_label("hand"), "image/png", REPLY_QUEUE);
    broker.publish(JOB_QUEUE, &codec::encode_job(&job).unwrap()).await.unwrap();

    let mut jobs = broker.subscribe(JOB_QUEUE).await.unwrap();
    let delivery = take(&mut jobs, 1).await.remove(0);

    broker.close();
    assert!(worker.handle(&delivery).await.is_err());
    assert_eq!(broker.unacked_len(JOB_QUEUE), 1);
}

/// Answers every job in the given order, echoing its own payload back.
async fn answer_in_order(broker: &MemoryBroker, order: &[usize]) {
    let mut jobs = broker.subscribe(JOB_QUEUE).await.unwrap();
    let deliveries = take(&mut jobs, order.len()).await;

    for &index in order {
        let job = codec::decode_job(&deliveries[index].payload).unwrap();
        let reply = AnalysisResult {
            job_id: job.job_id,
            status: AnalysisStatus::Ok {
                analysis_text: String::from_utf8(job.image_payload).unwrap(),
            },
        };
        broker
            .publish(&job.reply_to, &codec::encode_result(&reply).unwrap())
            .await
            .unwrap();
        broker.ack(&deliveries[index]).await.unwrap();
    }
}

fn shuffled_order() -> impl Strategy<Value = Vec<usize>> {
    (1usize..16).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn responses_reach_their_own_caller(order in shuffled_order()) {
        tokio_test::block_on(async {
            let broker = MemoryBroker::new();
            let dispatcher = Arc::new(
                Dispatcher::start(shared(&broker), JOB_QUEUE, REPLY_QUEUE).await.unwrap(),
            );

            let callers: Vec<_> = (0..order.len())
                .map(|i| {
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move {
                        let sent = format!("payload-{i}");
                        let got = dispatcher
                            .dispatch(
                                sent.clone().into_bytes(),
                                "image/png",
                                Duration::from_secs(10),
                            )
                            .await
                            .unwrap();
                        (sent, got)
                    })
                })
                .collect();

            answer_in_order(&broker, &order).await;

            for caller in callers {
                let (sent, got) = caller.await.unwrap();
                assert_eq!(sent, got);
            }
            assert_eq!(dispatcher.pending_count(), 0);
            dispatcher.shutdown().await;
        });
    }
}
