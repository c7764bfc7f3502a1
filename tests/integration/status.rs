//! Status event sequences and publishers.

use crate::common::{
    request, stage_list, test_config, EventLog, Harness, RecordingClusterBackend,
    RecordingDeviceBackend, WORKER_ID,
};
use mpc_jobs_core::error::TaskError;
use mpc_jobs_core::events::{JsonLinesStatusSink, TaskStatus};
use mpc_jobs_core::messaging::TaskState;
use mpc_jobs_core::models::{ClusterInitConfig, DeviceConfigs, SecureDeviceConfig, TaskParameters};
use mpc_jobs_core::registry::HandlerRegistry;
use serde_json::json;

const SUCCESS_STAGES: [&str; 7] = [
    "started",
    "cluster_init",
    "cluster_initialized",
    "device_creation",
    "devices_initialized",
    "task_execution",
    "task_completed",
];

fn echo_registry() -> HandlerRegistry {
    let registry = HandlerRegistry::new();
    registry
        .register_fn("echo", |_, params| Ok(json!({"echo": params.get("value")})))
        .unwrap();
    registry
        .register_fn("broken", |_, _| Err(TaskError::algorithm("matrix is singular")))
        .unwrap();
    registry
}

#[tokio::test]
async fn test_successful_job_publishes_every_stage_in_order() {
    let harness = Harness::new(echo_registry());
    harness.enqueue(request("t-1", "echo")).await;
    harness.worker.consumer().process_next().await.unwrap();

    let events = harness.worker.status_channel().events_for("t-1");
    let stages: Vec<String> = events.iter().map(|e| e.stage.to_string()).collect();
    assert_eq!(stages, stage_list(&SUCCESS_STAGES));

    let progress: Vec<f64> = events.iter().filter_map(|e| e.progress()).collect();
    assert_eq!(progress, vec![0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 1.0]);
    assert!(events[..6].iter().all(|e| e.status == TaskStatus::Running));
    assert!(events.iter().all(|e| e.worker_id == WORKER_ID));

    let completed = events.last().unwrap();
    assert_eq!(completed.status, TaskStatus::Success);
    assert!(completed.is_terminal());
    assert_eq!(completed.payload["result"], json!({"echo": null}));
    assert!(completed.payload["metrics"]["total_time"].as_f64().unwrap() > 0.0);
    assert!(completed.payload["execution_time"].is_number());
}

#[tokio::test]
async fn test_failed_job_publishes_attempt_and_final_failure() {
    let harness = Harness::new(echo_registry());
    harness.enqueue(request("t-1", "broken")).await;
    harness.worker.consumer().process_next().await.unwrap();

    let events = harness.worker.status_channel().events_for("t-1");
    let stages: Vec<String> = events.iter().map(|e| e.stage.to_string()).collect();
    let mut expected = stage_list(&SUCCESS_STAGES[..6]);
    expected.extend(stage_list(&["task_failed", "task_failed_final"]));
    assert_eq!(stages, expected);

    let failed = &events[6];
    assert_eq!(failed.status, TaskStatus::Failure);
    assert_eq!(failed.payload["error_type"], json!("AlgorithmError"));
    assert_eq!(failed.payload["retryable"], json!(false));
    assert!(!failed.is_terminal());

    let last = &events[7];
    assert_eq!(last.status, TaskStatus::Failure);
    assert!(last.is_terminal());
    assert_eq!(last.payload["error"], json!("Algorithm error: matrix is singular"));
}

#[tokio::test]
async fn test_retry_publishes_retrying_between_attempts() {
    let mut config = test_config();
    config.retry.max_retries = 1;
    let log = EventLog::default();
    let harness = Harness::build(
        echo_registry(),
        config,
        RecordingClusterBackend::failing(log.clone(), 1),
        RecordingDeviceBackend::new(log.clone()),
        log,
    );

    harness.enqueue(request("t-1", "echo")).await;
    harness.worker.consumer().process_next().await.unwrap();
    harness.worker.consumer().process_next().await.unwrap();

    let mut expected = stage_list(&["started", "cluster_init", "task_failed", "task_retrying"]);
    expected.extend(stage_list(&SUCCESS_STAGES));
    assert_eq!(harness.stages("t-1"), expected);

    let retrying = &harness.worker.status_channel().events_for("t-1")[3];
    assert_eq!(retrying.status, TaskStatus::Retry);
    assert_eq!(retrying.payload["error_type"], json!("ClusterInitError"));
    assert_eq!(retrying.payload["retry_count"], json!(1));
}

#[tokio::test]
async fn test_subscription_only_sees_matching_task_prefix() {
    let harness = Harness::new(echo_registry());
    let mut batch_a = harness.worker.status_channel().subscribe("batch-a-");

    harness.enqueue(request("batch-a-1", "echo")).await;
    harness.enqueue(request("batch-b-1", "echo")).await;
    harness.worker.consumer().process_next().await.unwrap();
    harness.worker.consumer().process_next().await.unwrap();

    let mut seen = Vec::new();
    while let Some(event) = batch_a.try_recv() {
        seen.push(event);
    }
    assert_eq!(seen.len(), SUCCESS_STAGES.len());
    assert!(seen.iter().all(|e| e.task_id == "batch-a-1"));
    assert_eq!(
        harness.worker.status_channel().task_ids(),
        vec!["batch-a-1".to_string(), "batch-b-1".to_string()]
    );
}

#[tokio::test]
async fn test_json_lines_sink_receives_every_event() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("status").join("events.jsonl");
    let mut config = test_config();
    config.status.json_lines_path = Some(path.clone());
    let harness = Harness::with_config(echo_registry(), config);

    harness.enqueue(request("t-1", "echo")).await;
    harness.worker.consumer().process_next().await.unwrap();
    // dropping the worker drains the background writer
    drop(harness);

    let events = JsonLinesStatusSink::read_events(&path).unwrap();
    let stages: Vec<String> = events.iter().map(|e| e.stage.to_string()).collect();
    assert_eq!(stages, stage_list(&SUCCESS_STAGES));
    assert!(events.iter().all(|e| e.task_id == "t-1" && e.worker_id == WORKER_ID));
    assert_eq!(events.last().unwrap().payload["result"], json!({"echo": null}));
}

#[tokio::test]
async fn test_client_status_follows_job_to_success() {
    let harness = Harness::new(echo_registry());
    let client = harness.worker.client();

    let message_id = client
        .submit(
            "t-1",
            ClusterInitConfig::local(["alice", "bob"]),
            DeviceConfigs::default().with_secure(SecureDeviceConfig::for_parties(["alice", "bob"])),
            TaskParameters::new("echo").with_field("value", json!(42)),
        )
        .await
        .unwrap();
    assert_eq!(client.get_status(&message_id).await.unwrap().state, TaskState::Pending);

    harness.worker.consumer().process_next().await.unwrap();

    let status = client.get_status(&message_id).await.unwrap();
    assert_eq!(status.state, TaskState::Success);
    assert!(status.ready && status.succeeded);
    let result = status.result.unwrap();
    assert_eq!(result.result, json!({"echo": 42}));
    assert_eq!(result.metadata.task_type, "echo");
    let delivery = result.delivery.unwrap();
    assert_eq!(delivery.message_id, message_id);
    assert_eq!(delivery.worker_id, WORKER_ID);
    assert_eq!(delivery.retry_count, 0);
}

#[tokio::test]
async fn test_status_history_is_bounded_to_recent_tasks() {
    let mut config = test_config();
    config.status.retained_tasks = 2;
    let harness = Harness::with_config(echo_registry(), config);

    for i in 1..=3 {
        harness.enqueue(request(&format!("t-{i}"), "echo")).await;
        harness.worker.consumer().process_next().await.unwrap();
    }

    let channel = harness.worker.status_channel();
    assert_eq!(channel.retained_tasks(), 2);
    assert_eq!(channel.task_ids(), vec!["t-2".to_string(), "t-3".to_string()]);
    assert!(channel.events_for("t-1").is_empty());
    assert_eq!(harness.stages("t-3"), stage_list(&SUCCESS_STAGES));
    // evicted history does not affect the stored result
    assert_eq!(harness.results.len(), 3);
}
