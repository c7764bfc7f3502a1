//! Worker assembly from configuration, and the background consumer loop.

use crate::common::{test_config, QUEUE};
use config::Environment;
use mpc_jobs_core::config::WorkerConfig;
use mpc_jobs_core::error::ConfigurationError;
use mpc_jobs_core::messaging::TaskState;
use mpc_jobs_core::models::{ClusterInitConfig, DeviceConfigs, SecureDeviceConfig, TaskParameters};
use mpc_jobs_core::registry::HandlerRegistry;
use mpc_jobs_core::resources::PartyFailurePolicy;
use mpc_jobs_core::worker::WorkerBuilder;
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_build_rejects_inconsistent_time_limits() {
    let mut config = test_config();
    config.timeouts.hard_time_limit_seconds = 1.0;

    let err = WorkerBuilder::new(config).build().unwrap_err();

    assert!(matches!(err, ConfigurationError::InvalidValue { .. }), "{err}");
}

#[test]
fn test_build_rejects_unusable_status_file() {
    let blocker = tempfile::NamedTempFile::new().unwrap();
    let mut config = test_config();
    config.status.json_lines_path = Some(blocker.path().join("events.jsonl"));

    match WorkerBuilder::new(config).build() {
        Err(ConfigurationError::InvalidValue { field, .. }) => {
            assert_eq!(field, "status.json_lines_path")
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_build_rejects_durations_out_of_range() {
    let cases: [(&str, fn(&mut WorkerConfig)); 4] = [
        ("retry.max_delay_seconds", |c| c.retry.max_delay_seconds = f64::INFINITY),
        ("retry.base_delay_seconds", |c| c.retry.base_delay_seconds = f64::NAN),
        ("retry.multiplier", |c| c.retry.multiplier = f64::INFINITY),
        ("worker.visibility_timeout_seconds", |c| c.worker.visibility_timeout_seconds = 1e300),
    ];

    for (expected, tweak) in cases {
        let mut config = test_config();
        tweak(&mut config);
        assert!(config.validate().is_err(), "{expected}");
        match WorkerBuilder::new(config).build() {
            Err(ConfigurationError::InvalidValue { field, .. }) => assert_eq!(field, expected),
            other => panic!("unexpected result for {expected}: {other:?}"),
        }
    }
}

#[test]
fn test_file_configuration_reaches_the_worker() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[worker]
node_id = "worker-7"
queue_name = "mpc_batch"

[retry]
max_retries = 5

[devices]
party_failure_policy = "fail_fast"
"#
    )
    .unwrap();

    let config = WorkerConfig::load_with_environment(
        Some(file.path()),
        Environment::with_prefix("MPC_JOBS_BOOTSTRAP_TEST"),
    )
    .unwrap();
    assert_eq!(config.devices.party_failure_policy, PartyFailurePolicy::FailFast);

    let worker = WorkerBuilder::new(config).build().unwrap();
    let settings = worker.consumer().settings();
    assert_eq!(settings.queue_name, "mpc_batch");
    assert_eq!(settings.retry.max_retries, 5);
    assert_eq!(worker.client().queue_name(), "mpc_batch");
    assert_eq!(worker.consumer().health().worker_id, "worker-7");
}

#[tokio::test]
async fn test_started_worker_processes_submitted_jobs() {
    let registry = Arc::new(HandlerRegistry::new());
    registry
        .register_fn("psi", |devices, _| Ok(json!(devices.len())))
        .unwrap();
    let worker = WorkerBuilder::new(test_config())
        .with_registry(registry)
        .build()
        .unwrap();

    let handle = worker.start();
    assert!(handle.is_running());

    let message_id = worker
        .client()
        .submit(
            "t-1",
            ClusterInitConfig::local(["alice", "bob"]),
            DeviceConfigs::default().with_secure(SecureDeviceConfig::for_parties(["alice", "bob"])),
            TaskParameters::new("psi"),
        )
        .await
        .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = worker.client().get_status(&message_id).await.unwrap();
            if status.ready {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job finishes");

    assert_eq!(status.state, TaskState::Success);
    assert_eq!(status.result.unwrap().result, json!(3));
    assert_eq!(worker.consumer().health().queue_name, QUEUE);

    handle.stop().await;
    assert!(!worker.consumer().is_in_flight());
}
