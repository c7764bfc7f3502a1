//! Handler registration and dispatch by task type.

use crate::common::{request, Harness};
use mpc_jobs_core::error::{RegistryError, TaskError};
use mpc_jobs_core::messaging::TaskState;
use mpc_jobs_core::registry::{FnHandler, HandlerRegistry};
use mpc_jobs_core::worker::ProcessOutcome;
use serde_json::{json, Value};
use std::sync::Arc;

#[test]
fn test_duplicate_registration_keeps_first_handler() {
    let registry = HandlerRegistry::new();
    registry.register_fn("psi", |_, _| Ok(json!("v1"))).unwrap();

    let err = registry
        .register("psi", Arc::new(FnHandler::new("psi-v2", |_, _| Ok(Value::Null))))
        .unwrap_err();

    assert_eq!(
        err,
        RegistryError::AlreadyRegistered {
            task_type: "psi".to_string(),
            existing: "fn:psi".to_string(),
            attempted: "psi-v2".to_string(),
        }
    );
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.handler_info("psi").unwrap().handler_name, "fn:psi");
}

#[tokio::test]
async fn test_unsupported_task_type_fails_without_retry() {
    let registry = HandlerRegistry::new();
    registry.register_fn("psi", |_, _| Ok(Value::Null)).unwrap();
    registry.register_fn("lr", |_, _| Ok(Value::Null)).unwrap();
    let harness = Harness::new(registry);

    let message = harness.enqueue(request("t-xgb", "xgb")).await;
    let outcome = harness.worker.consumer().process_next().await.unwrap();

    assert_eq!(
        outcome,
        ProcessOutcome::Failed {
            message_id: message.message_id.clone(),
            error: TaskError::UnsupportedTaskType {
                task_type: "xgb".to_string(),
                registered: vec!["lr".to_string(), "psi".to_string()],
            },
            retries_exhausted: false,
        }
    );
    assert_eq!(harness.queue.visible_count("jobs").await, 0);

    let status = harness.worker.client().get_status(&message.message_id).await.unwrap();
    assert_eq!(status.state, TaskState::Failure);
    let error_info = status.error_info.unwrap();
    assert_eq!(error_info.error_type, "UnsupportedTaskTypeError");
    assert!(error_info.error.contains("\"lr\""));
    assert!(!error_info.retries_exhausted);
}

#[tokio::test]
async fn test_dispatch_uses_handler_for_task_type() {
    let registry = HandlerRegistry::new();
    registry.register_fn("psi", |_, _| Ok(json!("psi-result"))).unwrap();
    registry.register_fn("lr", |_, params| {
        Ok(json!({"epochs": params.require::<u32>("epochs")?}))
    })
    .unwrap();
    let harness = Harness::new(registry);

    let mut lr = request("t-lr", "lr");
    lr.task_parameters = lr.task_parameters.with_field("epochs", json!(5));
    let message = harness.enqueue(lr).await;
    harness.worker.consumer().process_next().await.unwrap();

    let status = harness.worker.client().get_status(&message.message_id).await.unwrap();
    assert_eq!(status.result.unwrap().result, json!({"epochs": 5}));
}

#[tokio::test]
async fn test_missing_required_parameter_is_validation_failure() {
    let registry = HandlerRegistry::new();
    registry
        .register_fn("lr", |_, params| Ok(json!(params.require::<u32>("epochs")?)))
        .unwrap();
    let harness = Harness::new(registry);

    harness.enqueue(request("t-lr", "lr")).await;
    let outcome = harness.worker.consumer().process_next().await.unwrap();

    match outcome {
        ProcessOutcome::Failed {
            error: TaskError::ParameterValidation(msg),
            retries_exhausted: false,
            ..
        } => assert!(msg.contains("epochs")),
        other => panic!("unexpected outcome: {other:?}"),
    }
}
