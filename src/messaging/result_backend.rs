//! Per-message status records queried by [`crate::client::TaskClient::get_status`].

use crate::error::{MessagingError, TaskError};
use crate::models::TaskResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Started,
    Retry,
    Success,
    Failure,
}

impl TaskState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Started => "STARTED",
            Self::Retry => "RETRY",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        };
        f.write_str(name)
    }
}

/// Failure details of the latest attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub error: String,
    pub error_type: String,
    pub retries: u32,
    pub retries_exhausted: bool,
    pub execution_time: f64,
}

impl ErrorInfo {
    pub fn from_error(error: &TaskError, retries: u32, retries_exhausted: bool, execution_time: f64) -> Self {
        Self {
            error: error.to_string(),
            error_type: error.error_type().to_string(),
            retries,
            retries_exhausted,
            execution_time,
        }
    }
}

/// Status record for one submitted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusInfo {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub state: TaskState,
    pub ready: bool,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
    pub updated_at: DateTime<Utc>,
}

impl TaskStatusInfo {
    fn with_state(message_id: &str, task_id: Option<&str>, state: TaskState) -> Self {
        Self {
            message_id: message_id.to_string(),
            task_id: task_id.map(str::to_string),
            state,
            ready: state.is_ready(),
            succeeded: state == TaskState::Success,
            result: None,
            error_info: None,
            updated_at: Utc::now(),
        }
    }

    /// Record for a message nobody has reported on yet.
    pub fn pending(message_id: &str) -> Self {
        Self::with_state(message_id, None, TaskState::Pending)
    }

    pub fn queued(message_id: &str, task_id: &str) -> Self {
        Self::with_state(message_id, Some(task_id), TaskState::Pending)
    }

    pub fn started(message_id: &str, task_id: &str) -> Self {
        Self::with_state(message_id, Some(task_id), TaskState::Started)
    }

    pub fn retrying(message_id: &str, task_id: &str, error_info: ErrorInfo) -> Self {
        Self {
            error_info: Some(error_info),
            ..Self::with_state(message_id, Some(task_id), TaskState::Retry)
        }
    }

    pub fn succeeded(message_id: &str, task_id: &str, result: TaskResult) -> Self {
        Self {
            result: Some(result),
            ..Self::with_state(message_id, Some(task_id), TaskState::Success)
        }
    }

    pub fn failed(message_id: &str, task_id: &str, error_info: ErrorInfo) -> Self {
        Self {
            error_info: Some(error_info),
            ..Self::with_state(message_id, Some(task_id), TaskState::Failure)
        }
    }
}

/// Storage for status records, keyed by message id.
#[async_trait]
pub trait ResultBackend: Send + Sync + 'static {
    async fn store(&self, info: TaskStatusInfo) -> Result<(), MessagingError>;

    async fn get(&self, message_id: &str) -> Result<Option<TaskStatusInfo>, MessagingError>;
}

#[derive(Debug, Default)]
pub struct InMemoryResultBackend {
    records: DashMap<String, TaskStatusInfo>,
}

impl InMemoryResultBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ResultBackend for InMemoryResultBackend {
    /// A ready record is final; later writes for the same message are ignored.
    async fn store(&self, info: TaskStatusInfo) -> Result<(), MessagingError> {
        let mut entry = self
            .records
            .entry(info.message_id.clone())
            .or_insert_with(|| info.clone());
        if !entry.ready {
            *entry = info;
        }
        Ok(())
    }

    async fn get(&self, message_id: &str) -> Result<Option<TaskStatusInfo>, MessagingError> {
        Ok(self.records.get(message_id).map(|r| r.value().clone()))
    }
}
