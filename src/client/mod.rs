//! # Task Client
//!
//! Submission and status lookup for callers outside the worker.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let client = TaskClient::new(queue, results, "mpc_jobs").with_registry(registry);
//!
//! let message_id = client
//!     .submit(
//!         "job-17",
//!         ClusterInitConfig::local(["alice", "bob"]),
//!         DeviceConfigs::default().with_secure(SecureDeviceConfig::for_parties(["alice", "bob"])),
//!         TaskParameters::new("psi").with_field("receiver", json!("alice")),
//!     )
//!     .await?;
//!
//! let status = client.get_status(&message_id).await?;
//! ```

use crate::error::{MessagingError, SubmitError};
use crate::messaging::{ResultBackend, TaskMessage, TaskQueue, TaskStatusInfo};
use crate::models::{ClusterInitConfig, DeviceConfigs, TaskParameters, TaskRequest};
use crate::registry::HandlerRegistry;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Delayed execution for [`TaskClient::submit_with`]. `eta` wins over `countdown`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitOptions {
    pub countdown: Option<Duration>,
    pub eta: Option<DateTime<Utc>>,
}

impl SubmitOptions {
    pub fn countdown(delay: Duration) -> Self {
        Self {
            countdown: Some(delay),
            eta: None,
        }
    }

    pub fn eta(at: DateTime<Utc>) -> Self {
        Self {
            countdown: None,
            eta: Some(at),
        }
    }

    fn delay(&self) -> Duration {
        match (self.eta, self.countdown) {
            (Some(eta), _) => (eta - Utc::now()).to_std().unwrap_or(Duration::ZERO),
            (None, Some(countdown)) => countdown,
            (None, None) => Duration::ZERO,
        }
    }
}

#[derive(Clone)]
pub struct TaskClient {
    queue: Arc<dyn TaskQueue>,
    results: Arc<dyn ResultBackend>,
    queue_name: String,
    registry: Option<Arc<HandlerRegistry>>,
}

impl std::fmt::Debug for TaskClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskClient")
            .field("queue_name", &self.queue_name)
            .field("checks_registry", &self.registry.is_some())
            .finish()
    }
}

impl TaskClient {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        results: Arc<dyn ResultBackend>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            results,
            queue_name: queue_name.into(),
            registry: None,
        }
    }

    /// Reject task types the registry does not know at submit time.
    pub fn with_registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Enqueue a job for immediate execution. Returns its message id.
    pub async fn submit(
        &self,
        task_id: impl Into<String>,
        cluster_init_config: ClusterInitConfig,
        device_configs: DeviceConfigs,
        task_parameters: TaskParameters,
    ) -> Result<String, SubmitError> {
        self.submit_with(
            task_id,
            cluster_init_config,
            device_configs,
            task_parameters,
            SubmitOptions::default(),
        )
        .await
    }

    /// Enqueue a job, optionally delayed.
    ///
    /// # Errors
    ///
    /// [`SubmitError::MissingField`] for an empty task id, party list or task
    /// type; [`SubmitError::UnsupportedTaskType`] when a registry is attached and
    /// has no handler; [`SubmitError::Invalid`] for other structural problems.
    pub async fn submit_with(
        &self,
        task_id: impl Into<String>,
        cluster_init_config: ClusterInitConfig,
        device_configs: DeviceConfigs,
        task_parameters: TaskParameters,
        options: SubmitOptions,
    ) -> Result<String, SubmitError> {
        let request = TaskRequest::new(task_id, cluster_init_config, device_configs, task_parameters);
        self.check(&request)?;

        let message = TaskMessage::new(request);
        let delay = options.delay();
        // Recorded first so a worker that claims the message at once is not
        // overwritten by PENDING.
        self.results
            .store(TaskStatusInfo::queued(&message.message_id, message.task_id()))
            .await?;
        self.queue.send(&self.queue_name, &message, delay).await?;

        info!(
            task_id = %message.task_id(),
            message_id = %message.message_id,
            queue = %self.queue_name,
            delay_secs = delay.as_secs_f64(),
            "Task submitted"
        );
        Ok(message.message_id)
    }

    fn check(&self, request: &TaskRequest) -> Result<(), SubmitError> {
        if request.task_id.trim().is_empty() {
            return Err(SubmitError::MissingField("task_id".to_string()));
        }
        if request.cluster_init_config.parties.is_empty() {
            return Err(SubmitError::MissingField(
                "cluster_init_config.parties".to_string(),
            ));
        }
        let task_type = request
            .task_parameters
            .task_type()
            .ok_or_else(|| SubmitError::MissingField("task_parameters.task_type".to_string()))?;

        if let Some(registry) = &self.registry {
            if !registry.contains(task_type) {
                return Err(SubmitError::UnsupportedTaskType {
                    task_type: task_type.to_string(),
                    registered: registry.list_registered(),
                });
            }
        }

        request
            .validate()
            .map_err(|e| SubmitError::Invalid(e.to_string()))
    }

    /// Latest status of a submitted message; `PENDING` if nothing is known.
    pub async fn get_status(&self, message_id: &str) -> Result<TaskStatusInfo, MessagingError> {
        Ok(self
            .results
            .get(message_id)
            .await?
            .unwrap_or_else(|| TaskStatusInfo::pending(message_id)))
    }
}
