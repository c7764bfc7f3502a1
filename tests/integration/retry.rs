//! Retry decisions and backoff.

use crate::common::{request, test_config, EventLog, Harness, RecordingClusterBackend, RecordingDeviceBackend, QUEUE};
use mpc_jobs_core::error::TaskError;
use mpc_jobs_core::messaging::{TaskQueue, TaskState};
use mpc_jobs_core::registry::HandlerRegistry;
use mpc_jobs_core::worker::{ProcessOutcome, RetryDecision, RetryPolicy};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn flaky_cluster_harness(failures: u32, max_retries: u32) -> Harness {
    let mut config = test_config();
    config.retry.max_retries = max_retries;
    let log = EventLog::default();
    let registry = HandlerRegistry::new();
    registry.register_fn("psi", |_, _| Ok(json!("ok"))).unwrap();
    Harness::build(
        registry,
        config,
        RecordingClusterBackend::failing(log.clone(), failures),
        RecordingDeviceBackend::new(log.clone()),
        log,
    )
}

#[tokio::test]
async fn test_cluster_failure_is_retried_until_success() {
    let harness = flaky_cluster_harness(2, 3);
    let message = harness.enqueue(request("t-1", "psi")).await;
    let consumer = harness.worker.consumer();

    for attempt in 1..=2 {
        let outcome = consumer.process_next().await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Retried {
                message_id: message.message_id.clone(),
                attempt,
                delay: Duration::ZERO,
            }
        );
        assert_eq!(harness.queue.depth(QUEUE).await.unwrap(), 1);
        let status = harness.worker.client().get_status(&message.message_id).await.unwrap();
        assert_eq!(status.state, TaskState::Retry);
    }

    let outcome = consumer.process_next().await.unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Succeeded {
            message_id: message.message_id.clone()
        }
    );
    assert_eq!(harness.queue.depth(QUEUE).await.unwrap(), 0);

    let status = harness.worker.client().get_status(&message.message_id).await.unwrap();
    assert_eq!(status.state, TaskState::Success);
    assert_eq!(status.result.unwrap().delivery.unwrap().retry_count, 2);

    let retry_counts: Vec<u64> = harness
        .worker
        .status_channel()
        .events_for("t-1")
        .iter()
        .filter(|e| e.stage.as_str() == "task_retrying")
        .map(|e| e.payload["retry_count"].as_u64().unwrap())
        .collect();
    assert_eq!(retry_counts, vec![1, 2]);
    assert_eq!(harness.cluster.init_calls(), 3);
}

#[tokio::test]
async fn test_retries_exhausted_records_final_failure() {
    let harness = flaky_cluster_harness(u32::MAX, 2);
    let message = harness.enqueue(request("t-1", "psi")).await;
    let consumer = harness.worker.consumer();

    assert!(matches!(consumer.process_next().await.unwrap(), ProcessOutcome::Retried { attempt: 1, .. }));
    assert!(matches!(consumer.process_next().await.unwrap(), ProcessOutcome::Retried { attempt: 2, .. }));
    let outcome = consumer.process_next().await.unwrap();
    assert!(matches!(
        outcome,
        ProcessOutcome::Failed {
            error: TaskError::ClusterInit(_),
            retries_exhausted: true,
            ..
        }
    ));
    assert_eq!(harness.queue.depth(QUEUE).await.unwrap(), 0);

    let status = harness.worker.client().get_status(&message.message_id).await.unwrap();
    assert_eq!(status.state, TaskState::Failure);
    assert!(status.ready);
    let error_info = status.error_info.unwrap();
    assert_eq!(error_info.error_type, "ClusterInitError");
    assert_eq!(error_info.retries, 2);
    assert!(error_info.retries_exhausted);

    let last = harness.worker.status_channel().latest("t-1").unwrap();
    assert_eq!(last.stage.as_str(), "task_failed_final");
    assert_eq!(last.payload["retries_exhausted"], json!(true));
    assert_eq!(last.payload["retries"], json!(2));
}

#[tokio::test]
async fn test_device_config_error_from_handler_is_retried_to_the_limit() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let registry = HandlerRegistry::new();
    registry
        .register_fn("psi", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(TaskError::DeviceConfig("spu link dropped".into()))
        })
        .unwrap();
    let harness = Harness::new(registry);
    let message = harness.enqueue(request("t-1", "psi")).await;
    let consumer = harness.worker.consumer();

    for attempt in 1..=3 {
        assert!(matches!(
            consumer.process_next().await.unwrap(),
            ProcessOutcome::Retried { attempt: a, .. } if a == attempt
        ));
    }
    let outcome = consumer.process_next().await.unwrap();

    assert!(matches!(
        outcome,
        ProcessOutcome::Failed {
            error: TaskError::DeviceConfig(_),
            retries_exhausted: true,
            ..
        }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(harness.log.count("event:task_retrying"), 3);
    assert_eq!(harness.log.count("event:task_failed_final"), 1);
    assert_eq!(harness.cluster.shutdown_calls(), 4);
    assert_eq!(harness.queue.depth(QUEUE).await.unwrap(), 0);

    let error_info = harness
        .worker
        .client()
        .get_status(&message.message_id)
        .await
        .unwrap()
        .error_info
        .unwrap();
    assert_eq!(error_info.error_type, "DeviceConfigError");
    assert_eq!(error_info.retries, 3);
}

#[tokio::test]
async fn test_handler_errors_are_not_retried() {
    let registry = HandlerRegistry::new();
    registry
        .register_fn("psi", |_, _| Err(TaskError::algorithm("diverged")))
        .unwrap();
    let harness = Harness::new(registry);

    harness.enqueue(request("t-1", "psi")).await;
    let outcome = harness.worker.consumer().process_next().await.unwrap();

    assert!(matches!(
        outcome,
        ProcessOutcome::Failed {
            error: TaskError::Algorithm(_),
            retries_exhausted: false,
            ..
        }
    ));
    assert_eq!(harness.queue.depth(QUEUE).await.unwrap(), 0);
    assert_eq!(harness.log.count("event:task_retrying"), 0);
}

#[tokio::test]
async fn test_retry_is_hidden_until_backoff_elapses() {
    let mut config = test_config();
    config.retry.base_delay_seconds = 60.0;
    config.retry.max_delay_seconds = 600.0;
    let log = EventLog::default();
    let registry = HandlerRegistry::new();
    registry.register_fn("psi", |_, _| Ok(json!("ok"))).unwrap();
    let harness = Harness::build(
        registry,
        config,
        RecordingClusterBackend::failing(log.clone(), 1),
        RecordingDeviceBackend::new(log.clone()),
        log,
    );

    harness.enqueue(request("t-1", "psi")).await;
    let outcome = harness.worker.consumer().process_next().await.unwrap();

    assert!(matches!(
        outcome,
        ProcessOutcome::Retried { attempt: 1, delay, .. } if delay == Duration::from_secs(60)
    ));
    assert_eq!(harness.queue.depth(QUEUE).await.unwrap(), 1);
    assert_eq!(harness.queue.visible_count(QUEUE).await, 0);
    assert_eq!(harness.worker.consumer().process_next().await.unwrap(), ProcessOutcome::Idle);

    let retrying = harness.worker.status_channel().latest("t-1").unwrap();
    assert_eq!(retrying.payload["countdown"], json!(60.0));
    assert_eq!(retrying.payload["max_retries"], json!(3));
}

#[test]
fn test_backoff_doubles_up_to_cap() {
    let policy = RetryPolicy {
        max_retries: 5,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(5),
        multiplier: 2.0,
        jitter_enabled: false,
        max_jitter: 0.0,
    };
    let error = TaskError::DeviceConfig("spu unavailable".into());

    let delays: Vec<Duration> = (0..5)
        .map(|retries| match policy.decide(&error, retries) {
            RetryDecision::Retry { delay, .. } => delay,
            other => panic!("unexpected decision: {other:?}"),
        })
        .collect();

    assert_eq!(
        delays,
        [1, 2, 4, 5, 5].map(Duration::from_secs).to_vec()
    );
    assert_eq!(
        policy.decide(&error, 5),
        RetryDecision::GiveUp {
            retries_exhausted: true
        }
    );
}

#[test]
fn test_jitter_stays_within_fraction_of_delay() {
    let policy = RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_secs(10),
        max_delay: Duration::from_secs(100),
        multiplier: 2.0,
        jitter_enabled: true,
        max_jitter: 0.1,
    };

    for _ in 0..100 {
        let delay = policy.delay_for(1).as_secs_f64();
        assert!((18.0..=22.0).contains(&delay), "{delay}");
    }
}
