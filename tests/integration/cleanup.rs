//! Resource release on every exit path.

use crate::common::{
    request, test_config, EventLog, HangingHandler, Harness, RecordingClusterBackend,
    RecordingDeviceBackend,
};
use mpc_jobs_core::error::TaskError;
use mpc_jobs_core::registry::HandlerRegistry;
use mpc_jobs_core::worker::ProcessOutcome;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn assert_released_after(log: &EventLog, final_event: &str) {
    let event = log.position(final_event).expect("final event published");
    let cluster = log.position("cluster_shutdown").expect("cluster shut down");
    let entries = log.entries();
    let device_shutdowns: Vec<usize> = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.starts_with("device_shutdown:"))
        .map(|(i, _)| i)
        .collect();

    assert!(!device_shutdowns.is_empty(), "{entries:?}");
    for index in device_shutdowns {
        assert!(index > event, "device released before final event: {entries:?}");
        assert!(index < cluster, "device released after cluster: {entries:?}");
    }
}

#[tokio::test]
async fn test_success_releases_devices_then_cluster() {
    let registry = HandlerRegistry::new();
    registry.register_fn("psi", |_, _| Ok(json!("ok"))).unwrap();
    let harness = Harness::new(registry);

    harness.enqueue(request("t-1", "psi")).await;
    harness.worker.consumer().process_next().await.unwrap();

    assert_released_after(&harness.log, "event:task_completed");
    assert_eq!(harness.log.count("device_shutdown:"), 3);
    let health = harness.worker.consumer().health();
    assert!(!health.cluster_ready);
    assert_eq!(health.devices_held, 0);
}

#[tokio::test]
async fn test_handler_error_still_releases_resources() {
    let registry = HandlerRegistry::new();
    registry
        .register_fn("psi", |_, _| Err(TaskError::DataLoad("missing input".into())))
        .unwrap();
    let harness = Harness::new(registry);

    harness.enqueue(request("t-1", "psi")).await;
    let outcome = harness.worker.consumer().process_next().await.unwrap();

    assert!(matches!(
        outcome,
        ProcessOutcome::Failed {
            error: TaskError::DataLoad(_),
            ..
        }
    ));
    assert_released_after(&harness.log, "event:task_failed");
    assert_eq!(harness.log.count("device_shutdown:alice"), 1);
    assert_eq!(harness.log.count("device_shutdown:bob"), 1);
    assert_eq!(harness.log.count("device_shutdown:spu"), 1);
    assert_eq!(harness.cluster.shutdown_calls(), 1);
    assert_eq!(harness.worker.consumer().health().devices_held, 0);
}

#[tokio::test]
async fn test_handler_panic_is_contained_and_releases_resources() {
    let registry = HandlerRegistry::new();
    registry
        .register_fn("psi", |_, _| panic!("index out of bounds"))
        .unwrap();
    let harness = Harness::new(registry);

    harness.enqueue(request("t-1", "psi")).await;
    let outcome = harness.worker.consumer().process_next().await.unwrap();

    match outcome {
        ProcessOutcome::Failed {
            error: TaskError::Algorithm(msg),
            ..
        } => assert!(msg.contains("index out of bounds"), "{msg}"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_released_after(&harness.log, "event:task_failed");
}

#[tokio::test]
async fn test_cluster_failure_creates_no_devices() {
    let mut config = test_config();
    config.retry.max_retries = 0;
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
        ProcessOutcome::Failed {
            error: TaskError::ClusterInit(_),
            retries_exhausted: true,
            ..
        }
    ));
    assert_eq!(harness.log.count("device_create:"), 0);
    // never became ready, so there is nothing to shut down
    assert_eq!(harness.cluster.shutdown_calls(), 0);
}

#[tokio::test]
async fn test_abandoned_attempt_releases_resources_on_drop() {
    let handler = Arc::new(HangingHandler::hanging());
    let registry = HandlerRegistry::new();
    registry.register("psi", handler.clone()).unwrap();
    let harness = Harness::new(registry);

    harness.enqueue(request("t-1", "psi")).await;
    let attempt = tokio::time::timeout(
        Duration::from_millis(100),
        harness.worker.consumer().process_next(),
    )
    .await;

    assert!(attempt.is_err());
    assert_eq!(handler.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(harness.log.count("device_shutdown:"), 3);
    assert_eq!(harness.cluster.shutdown_calls(), 1);
    assert!(!harness.worker.consumer().is_in_flight());
}
