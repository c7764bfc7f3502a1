//! Status event types published while a job runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Coarse job status carried by every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Running,
    Retry,
    Success,
    Failure,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Retry => write!(f, "RETRY"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
        }
    }
}

/// Fine-grained stage within a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Started,
    ClusterInit,
    ClusterInitialized,
    DeviceCreation,
    DevicesInitialized,
    TaskExecution,
    TaskCompleted,
    TaskFailed,
    Timeout,
    TaskRetrying,
    TaskFailedFinal,
}

impl Stage {
    /// Progress fraction reported with the stage, for stages that have one.
    pub fn progress(&self) -> Option<f64> {
        match self {
            Self::Started => Some(0.0),
            Self::ClusterInit => Some(0.1),
            Self::ClusterInitialized => Some(0.2),
            Self::DeviceCreation => Some(0.3),
            Self::DevicesInitialized => Some(0.4),
            Self::TaskExecution => Some(0.5),
            Self::TaskCompleted => Some(1.0),
            Self::TaskFailed
            | Self::Timeout
            | Self::TaskRetrying
            | Self::TaskFailedFinal => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::ClusterInit => "cluster_init",
            Self::ClusterInitialized => "cluster_initialized",
            Self::DeviceCreation => "device_creation",
            Self::DevicesInitialized => "devices_initialized",
            Self::TaskExecution => "task_execution",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::Timeout => "timeout",
            Self::TaskRetrying => "task_retrying",
            Self::TaskFailedFinal => "task_failed_final",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress record for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub task_id: String,
    pub status: TaskStatus,
    pub stage: Stage,
    pub timestamp: DateTime<Utc>,
    pub worker_id: String,
    pub payload: Value,
}

impl StatusEvent {
    /// Build an event. The payload always carries `stage`, and `progress` when
    /// the stage defines one; extra object fields are merged in.
    pub fn new(
        task_id: impl Into<String>,
        status: TaskStatus,
        stage: Stage,
        worker_id: impl Into<String>,
        extra: Value,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert("stage".to_string(), json!(stage.as_str()));
        if let Some(progress) = stage.progress() {
            payload.insert("progress".to_string(), json!(progress));
        }
        match extra {
            Value::Object(fields) => payload.extend(fields),
            Value::Null => {}
            other => {
                payload.insert("data".to_string(), other);
            }
        }

        Self {
            task_id: task_id.into(),
            status,
            stage,
            timestamp: Utc::now(),
            worker_id: worker_id.into(),
            payload: Value::Object(payload),
        }
    }

    pub fn progress(&self) -> Option<f64> {
        self.payload.get("progress").and_then(Value::as_f64)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            (self.status, self.stage),
            (TaskStatus::Success, Stage::TaskCompleted) | (TaskStatus::Failure, Stage::TaskFailedFinal)
        )
    }
}
