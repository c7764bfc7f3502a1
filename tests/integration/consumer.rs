//! Single-flight consumption, late acknowledgement and time limits.

use crate::common::{request, test_config, ConcurrencyTracker, HangingHandler, Harness, QUEUE};
use mpc_jobs_core::error::TaskError;
use mpc_jobs_core::messaging::{TaskQueue, TaskState};
use mpc_jobs_core::models::ClusterInitConfig;
use mpc_jobs_core::registry::HandlerRegistry;
use mpc_jobs_core::worker::ProcessOutcome;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_concurrent_polls_run_one_job_at_a_time() {
    let tracker = Arc::new(ConcurrencyTracker::new(Duration::from_millis(50)));
    let registry = HandlerRegistry::new();
    registry.register("psi", tracker.clone()).unwrap();
    let harness = Harness::new(registry);
    for i in 0..3 {
        harness.enqueue(request(&format!("t-{i}"), "psi")).await;
    }

    let consumer = harness.worker.consumer();
    let (a, b, c) = tokio::join!(consumer.process_next(), consumer.process_next(), consumer.process_next());

    for outcome in [a, b, c] {
        assert!(matches!(outcome.unwrap(), ProcessOutcome::Succeeded { .. }));
    }
    assert_eq!(tracker.calls.load(Ordering::SeqCst), 3);
    assert_eq!(tracker.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(harness.cluster.init_calls(), 3);
}

#[tokio::test]
async fn test_unfinished_attempt_is_redelivered_after_visibility_timeout() {
    let mut config = test_config();
    config.worker.visibility_timeout_seconds = 0.5;
    config.timeouts.soft_time_limit_seconds = 0.3;
    config.timeouts.hard_time_limit_seconds = 0.4;
    let handler = Arc::new(HangingHandler::hanging());
    let registry = HandlerRegistry::new();
    registry.register("psi", handler.clone()).unwrap();
    let harness = Harness::with_config(registry, config);

    let message = harness.enqueue(request("t-1", "psi")).await;
    let attempt = tokio::time::timeout(
        Duration::from_millis(100),
        harness.worker.consumer().process_next(),
    )
    .await;
    assert!(attempt.is_err());

    // Not acknowledged, but still invisible
    assert_eq!(harness.queue.depth(QUEUE).await.unwrap(), 1);
    assert!(harness.queue.receive(QUEUE, Duration::from_secs(30)).await.unwrap().is_none());
    let status = harness.worker.client().get_status(&message.message_id).await.unwrap();
    assert_eq!(status.state, TaskState::Started);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let redelivered = harness
        .queue
        .receive(QUEUE, Duration::from_millis(1))
        .await
        .unwrap()
        .expect("message visible again");
    assert_eq!(redelivered.delivery_count, 2);
    assert!(redelivered.is_redelivery());
    assert_eq!(redelivered.decode().unwrap().message_id, message.message_id);

    handler.hang.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let outcome = harness.worker.consumer().process_next().await.unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Succeeded {
            message_id: message.message_id.clone()
        }
    );
    assert_eq!(harness.queue.depth(QUEUE).await.unwrap(), 0);
}

#[tokio::test]
async fn test_redelivery_of_finished_message_is_acknowledged() {
    let tracker = Arc::new(ConcurrencyTracker::new(Duration::ZERO));
    let registry = HandlerRegistry::new();
    registry.register("psi", tracker.clone()).unwrap();
    let harness = Harness::new(registry);

    let message = harness.enqueue(request("t-1", "psi")).await;
    harness.worker.consumer().process_next().await.unwrap();

    harness.queue.send(QUEUE, &message, Duration::ZERO).await.unwrap();
    let outcome = harness.worker.consumer().process_next().await.unwrap();

    assert_eq!(
        outcome,
        ProcessOutcome::Duplicate {
            message_id: message.message_id.clone()
        }
    );
    assert_eq!(tracker.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.queue.depth(QUEUE).await.unwrap(), 0);
}

#[tokio::test]
async fn test_undecodable_message_is_discarded() {
    let harness = Harness::new(HandlerRegistry::new());
    harness
        .queue
        .send_raw(QUEUE, json!({"task_id": 17}), Duration::ZERO)
        .await
        .unwrap();

    let outcome = harness.worker.consumer().process_next().await.unwrap();

    assert!(matches!(outcome, ProcessOutcome::Discarded { .. }));
    assert_eq!(harness.queue.depth(QUEUE).await.unwrap(), 0);
    assert_eq!(harness.worker.consumer().process_next().await.unwrap(), ProcessOutcome::Idle);
}

#[tokio::test]
async fn test_invalid_request_fails_before_touching_resources() {
    let registry = HandlerRegistry::new();
    registry.register_fn("psi", |_, _| Ok(json!("ok"))).unwrap();
    let harness = Harness::new(registry);

    let mut bad = request("t-1", "psi");
    bad.cluster_init_config = ClusterInitConfig::local(["alice", "alice"]);
    harness.enqueue(bad).await;
    let outcome = harness.worker.consumer().process_next().await.unwrap();

    match outcome {
        ProcessOutcome::Failed {
            error: TaskError::ParameterValidation(msg),
            retries_exhausted: false,
            ..
        } => assert!(msg.contains("duplicate party 'alice'"), "{msg}"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(harness.cluster.init_calls(), 0);
    assert_eq!(harness.stages("t-1"), vec!["task_failed_final".to_string()]);
}

#[tokio::test]
async fn test_soft_time_limit_cancels_dispatch() {
    let mut config = test_config();
    config.timeouts.soft_time_limit_seconds = 0.1;
    let registry = HandlerRegistry::new();
    registry.register("psi", Arc::new(HangingHandler::hanging())).unwrap();
    let harness = Harness::with_config(registry, config);

    harness.enqueue(request("t-1", "psi")).await;
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        harness.worker.consumer().process_next(),
    )
    .await
    .expect("soft limit ends the attempt")
    .unwrap();

    match outcome {
        ProcessOutcome::Failed {
            error: TaskError::Timeout { stage, elapsed },
            retries_exhausted: false,
            ..
        } => {
            assert_eq!(stage, "dispatching");
            assert!(elapsed >= Duration::from_millis(50), "{elapsed:?}");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let stages = harness.stages("t-1");
    assert_eq!(&stages[stages.len() - 2..], ["timeout", "task_failed_final"]);
    assert_eq!(harness.log.count("device_shutdown:"), 3);
    assert!(harness.hard_timeouts.fired().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hard_time_limit_fires_for_blocking_handler() {
    let mut config = test_config();
    config.timeouts.soft_time_limit_seconds = 0.1;
    config.timeouts.hard_time_limit_seconds = 0.2;
    let registry = HandlerRegistry::new();
    registry
        .register_fn("psi", |_, _| {
            std::thread::sleep(Duration::from_millis(600));
            Ok(json!("late"))
        })
        .unwrap();
    let harness = Harness::with_config(registry, config);

    harness.enqueue(request("t-block", "psi")).await;
    harness.worker.consumer().process_next().await.unwrap();

    assert_eq!(harness.hard_timeouts.fired(), vec!["t-block".to_string()]);
}

#[tokio::test]
async fn test_health_counts_outcomes() {
    let registry = HandlerRegistry::new();
    registry.register_fn("ok", |_, _| Ok(json!(1))).unwrap();
    registry
        .register_fn("bad", |_, _| Err(TaskError::ResultSave("disk full".into())))
        .unwrap();
    let harness = Harness::new(registry);

    harness.enqueue(request("t-ok", "ok")).await;
    harness.enqueue(request("t-bad", "bad")).await;
    let consumer = harness.worker.consumer();
    consumer.process_next().await.unwrap();
    consumer.process_next().await.unwrap();

    let health = consumer.health();
    assert_eq!(health.worker_id, "worker-test");
    assert_eq!(health.queue_name, QUEUE);
    assert_eq!(health.processed, 2);
    assert_eq!(health.succeeded, 1);
    assert_eq!(health.failed, 1);
    assert_eq!(health.retried, 0);
    assert!(!health.in_flight);
}
