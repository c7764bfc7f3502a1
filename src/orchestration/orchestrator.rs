//! # Task Orchestrator
//!
//! Runs one job end to end:
//!
//! ```text
//! started ─→ cluster_init ─→ device_init ─→ dispatching ─→ collecting_metrics ─→ succeeded
//!    │            │               │              │                 │
//!    └────────────┴───────────────┴──────────────┴─────────────────┴──────────→ failed
//!
//! cleanup (devices, then cluster) runs on every exit path
//! ```
//!
//! Progress is published at every phase boundary. The soft-timeout token is
//! checked between phases and raced against the handler future.

use super::guard::ResourceGuard;
use crate::error::{Result, TaskError};
use crate::events::{Stage, StatusNotifier, TaskStatus};
use crate::logging::{log_task_error, log_task_operation};
use crate::models::{PerformanceMetrics, TaskMetadata, TaskRequest, TaskResult};
use crate::registry::{HandlerContext, HandlerRegistry};
use crate::resources::cluster::panic_message;
use crate::resources::{ClusterManager, DeviceManager, DeviceSet, PartyDeviceConfig};
use crate::state_machine::{OrchestrationState, OrchestrationStateMachine};
use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Copy)]
struct PhaseTimings {
    cluster_init: Option<Duration>,
    device_init: Option<Duration>,
    handler_exec: Option<Duration>,
}

struct Completed {
    result: Value,
    task_type: String,
    devices_used: Vec<String>,
}

/// Sequences cluster, devices and handler for one job at a time.
pub struct TaskOrchestrator {
    cluster: Arc<ClusterManager>,
    devices: Arc<DeviceManager>,
    registry: Arc<HandlerRegistry>,
    notifier: StatusNotifier,
    party_config: PartyDeviceConfig,
}

impl std::fmt::Debug for TaskOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOrchestrator")
            .field("cluster", &self.cluster)
            .field("registry", &self.registry)
            .field("party_config", &self.party_config)
            .finish()
    }
}

impl TaskOrchestrator {
    pub fn new(
        cluster: Arc<ClusterManager>,
        devices: Arc<DeviceManager>,
        registry: Arc<HandlerRegistry>,
        notifier: StatusNotifier,
    ) -> Self {
        Self {
            cluster,
            devices,
            registry,
            notifier,
            party_config: PartyDeviceConfig::default(),
        }
    }

    pub fn with_party_config(mut self, party_config: PartyDeviceConfig) -> Self {
        self.party_config = party_config;
        self
    }

    pub fn cluster(&self) -> &Arc<ClusterManager> {
        &self.cluster
    }

    pub fn devices(&self) -> &Arc<DeviceManager> {
        &self.devices
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn notifier(&self) -> &StatusNotifier {
        &self.notifier
    }

    /// Run one job.
    ///
    /// Publishes `RUNNING` events per phase and exactly one of
    /// `SUCCESS/task_completed`, `FAILURE/task_failed` or `FAILURE/timeout`.
    /// Devices and the cluster are released before this returns.
    ///
    /// # Errors
    ///
    /// The first error of any phase, unchanged. Handler panics become
    /// [`TaskError::Algorithm`]; a cancelled token becomes
    /// [`TaskError::Timeout`].
    pub async fn execute(
        &self,
        request: &TaskRequest,
        cancellation: &CancellationToken,
    ) -> Result<TaskResult> {
        let task_id = request.task_id.as_str();
        let started_at = Utc::now();
        let start = Instant::now();
        let mut state_machine = OrchestrationStateMachine::new(task_id);
        let mut timings = PhaseTimings::default();

        info!(task_id = %task_id, task_type = request.task_type_or_unknown(), "Starting task");
        self.notifier.notify(
            task_id,
            TaskStatus::Running,
            Stage::Started,
            json!({"task_type": request.task_parameters.task_type()}),
        );

        let guard = ResourceGuard::new(task_id, self.cluster.clone(), self.devices.clone());
        let outcome = self
            .run_phases(request, cancellation, &mut state_machine, &mut timings, start)
            .await;

        let total = start.elapsed();
        let metrics = PerformanceMetrics::collect(
            total,
            timings.cluster_init,
            timings.device_init,
            timings.handler_exec,
        );

        let result = match outcome {
            Ok(completed) => {
                advance(&mut state_machine, OrchestrationState::Succeeded)?;
                self.notifier.notify(
                    task_id,
                    TaskStatus::Success,
                    Stage::TaskCompleted,
                    json!({
                        "result": completed.result,
                        "metrics": metrics,
                        "execution_time": total.as_secs_f64(),
                    }),
                );
                log_task_operation("execute", task_id, Some(&completed.task_type), "succeeded", None);

                Ok(TaskResult::success(
                    completed.result,
                    metrics,
                    TaskMetadata {
                        task_id: task_id.to_string(),
                        task_type: completed.task_type,
                        started_at,
                        completed_at: Utc::now(),
                        devices_used: completed.devices_used,
                    },
                ))
            }
            Err(e) => {
                state_machine.fail();
                let stage = if e.is_timeout() {
                    Stage::Timeout
                } else {
                    Stage::TaskFailed
                };
                log_task_error(
                    "orchestrator",
                    task_id,
                    &e,
                    Some(&format!("execution_time={:.3}s", total.as_secs_f64())),
                );
                self.notifier.notify(
                    task_id,
                    TaskStatus::Failure,
                    stage,
                    json!({
                        "error": e.to_string(),
                        "error_type": e.error_type(),
                        "retryable": e.is_retryable(),
                        "execution_time": total.as_secs_f64(),
                        "metrics": metrics,
                    }),
                );
                log_task_operation("execute", task_id, request.task_parameters.task_type(), "failed", Some(e.error_type()));
                Err(e)
            }
        };

        guard.release();
        result
    }

    async fn run_phases(
        &self,
        request: &TaskRequest,
        cancellation: &CancellationToken,
        state_machine: &mut OrchestrationStateMachine,
        timings: &mut PhaseTimings,
        start: Instant,
    ) -> Result<Completed> {
        let task_id = request.task_id.as_str();

        // Cluster
        checkpoint(cancellation, state_machine, start)?;
        advance(state_machine, OrchestrationState::ClusterInit)?;
        self.notifier
            .notify(task_id, TaskStatus::Running, Stage::ClusterInit, Value::Null);

        let phase = Instant::now();
        self.cluster.initialize(&request.cluster_init_config)?;
        let cluster_time = phase.elapsed();
        timings.cluster_init = Some(cluster_time);
        self.notifier.notify(
            task_id,
            TaskStatus::Running,
            Stage::ClusterInitialized,
            json!({"init_time": cluster_time.as_secs_f64()}),
        );

        // Devices
        checkpoint(cancellation, state_machine, start)?;
        advance(state_machine, OrchestrationState::DeviceInit)?;
        self.notifier
            .notify(task_id, TaskStatus::Running, Stage::DeviceCreation, Value::Null);

        let phase = Instant::now();
        let devices = self.devices.initialize_cluster_devices(
            &request.cluster_init_config.parties,
            &self.party_config,
            request.device_configs.secure_device_config.as_ref(),
            request.device_configs.homomorphic_device_config.as_ref(),
        )?;
        let device_time = phase.elapsed();
        timings.device_init = Some(device_time);
        self.notifier.notify(
            task_id,
            TaskStatus::Running,
            Stage::DevicesInitialized,
            json!({"devices": devices.names(), "init_time": device_time.as_secs_f64()}),
        );

        // Handler
        checkpoint(cancellation, state_machine, start)?;
        advance(state_machine, OrchestrationState::Dispatching)?;
        let task_type = request
            .task_parameters
            .task_type()
            .ok_or_else(|| TaskError::algorithm("task_parameters.task_type is required"))?
            .to_string();
        self.check_referenced_parties(request, &devices)?;
        self.notifier.notify(
            task_id,
            TaskStatus::Running,
            Stage::TaskExecution,
            json!({"task_type": task_type}),
        );

        let ctx = HandlerContext::new(task_id, cancellation.clone());
        let phase = Instant::now();
        let dispatch = AssertUnwindSafe(self.registry.dispatch(
            &task_type,
            &devices,
            &request.task_parameters,
            &ctx,
        ))
        .catch_unwind();

        let outcome = tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                warn!(task_id = %task_id, task_type = %task_type, "Soft time limit reached during dispatch");
                Err(timeout_error(state_machine, start))
            }
            dispatched = dispatch => match dispatched {
                Ok(result) => result,
                Err(panic) => Err(TaskError::algorithm(format!(
                    "handler for '{task_type}' panicked: {}",
                    panic_message(&panic)
                ))),
            },
        };
        timings.handler_exec = Some(phase.elapsed());
        let result = outcome?;

        advance(state_machine, OrchestrationState::CollectingMetrics)?;
        Ok(Completed {
            result,
            task_type,
            devices_used: devices.names(),
        })
    }

    /// Every party named in the task parameters must be a cluster member and,
    /// when party devices are enabled, hold a device.
    fn check_referenced_parties(&self, request: &TaskRequest, devices: &DeviceSet) -> Result<()> {
        let referenced = request.task_parameters.referenced_parties();
        let members = &request.cluster_init_config.parties;
        let outside: Vec<&String> = referenced
            .iter()
            .filter(|party| !members.contains(*party))
            .collect();
        if !outside.is_empty() {
            return Err(TaskError::algorithm(format!(
                "task parameters reference parties {outside:?} that are not cluster parties {members:?}"
            )));
        }
        if self.party_config.enabled {
            devices.require_parties(&referenced)?;
        }
        Ok(())
    }
}

fn advance(state_machine: &mut OrchestrationStateMachine, to: OrchestrationState) -> Result<()> {
    state_machine
        .transition(to)
        .map_err(|e| TaskError::algorithm(format!("orchestration state error: {e}")))
}

fn checkpoint(
    cancellation: &CancellationToken,
    state_machine: &OrchestrationStateMachine,
    start: Instant,
) -> Result<()> {
    if cancellation.is_cancelled() {
        return Err(timeout_error(state_machine, start));
    }
    Ok(())
}

fn timeout_error(state_machine: &OrchestrationStateMachine, start: Instant) -> TaskError {
    TaskError::Timeout {
        stage: state_machine.current_state().to_string(),
        elapsed: start.elapsed(),
    }
}
