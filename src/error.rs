//! # Error Taxonomy
//!
//! Typed errors for every concern in the worker. [`TaskError`] is the sum type the
//! queue consumer inspects to decide between retrying and reporting a terminal failure:
//!
//! | Variant               | Native name                | Retryable |
//! |-----------------------|----------------------------|-----------|
//! | `ClusterInit`         | `ClusterInitError`         | yes       |
//! | `DeviceConfig`        | `DeviceConfigError`        | yes       |
//! | `Algorithm`           | `AlgorithmError`           | no        |
//! | `ParameterValidation` | `ParameterValidationError` | no        |
//! | `DataLoad`            | `DataLoadError`            | no        |
//! | `ResultSave`          | `ResultSaveError`          | no        |
//! | `UnsupportedTaskType` | `UnsupportedTaskTypeError` | no        |
//! | `Timeout`             | `SoftTimeLimitExceeded`    | no        |

use std::time::Duration;
use thiserror::Error;

/// Errors raised while executing one task attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    #[error("Cluster initialization failed: {0}")]
    ClusterInit(String),
    #[error("Device configuration error: {0}")]
    DeviceConfig(String),
    #[error("Algorithm error: {0}")]
    Algorithm(String),
    #[error("Parameter validation error: {0}")]
    ParameterValidation(String),
    #[error("Data load error: {0}")]
    DataLoad(String),
    #[error("Result save error: {0}")]
    ResultSave(String),
    #[error("Unsupported task type '{task_type}', registered task types: {registered:?}")]
    UnsupportedTaskType {
        task_type: String,
        registered: Vec<String>,
    },
    #[error("Soft time limit exceeded during {stage} after {elapsed:?}")]
    Timeout { stage: String, elapsed: Duration },
}

impl TaskError {
    /// Whether the queue consumer may retry the attempt.
    ///
    /// Only infrastructure failures are transient; everything the handler reports
    /// is a logic or data failure that will fail again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ClusterInit(_) | Self::DeviceConfig(_))
    }

    /// Whether this error came from the soft-timeout signal.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Native type name reported in status events and result records.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::ClusterInit(_) => "ClusterInitError",
            Self::DeviceConfig(_) => "DeviceConfigError",
            Self::Algorithm(_) => "AlgorithmError",
            Self::ParameterValidation(_) => "ParameterValidationError",
            Self::DataLoad(_) => "DataLoadError",
            Self::ResultSave(_) => "ResultSaveError",
            Self::UnsupportedTaskType { .. } => "UnsupportedTaskTypeError",
            Self::Timeout { .. } => "SoftTimeLimitExceeded",
        }
    }

    pub fn algorithm(msg: impl Into<String>) -> Self {
        Self::Algorithm(msg.into())
    }

    pub fn parameter(msg: impl Into<String>) -> Self {
        Self::ParameterValidation(msg.into())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(error: serde_json::Error) -> Self {
        TaskError::ParameterValidation(format!("JSON serialization error: {error}"))
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;

/// Handler registration errors. Raised at startup, never at dispatch time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("Task type '{task_type}' is already registered to handler '{existing}', refusing '{attempted}'")]
    AlreadyRegistered {
        task_type: String,
        existing: String,
        attempted: String,
    },
    #[error("Invalid registration: {0}")]
    Invalid(String),
}

/// Queue, result backend and status sink failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MessagingError {
    #[error("Queue '{0}' does not exist")]
    QueueNotFound(String),
    #[error("Message receipt {receipt} not found in queue '{queue}'")]
    ReceiptNotFound { queue: String, receipt: i64 },
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for MessagingError {
    fn from(error: serde_json::Error) -> Self {
        MessagingError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for MessagingError {
    fn from(error: std::io::Error) -> Self {
        MessagingError::Backend(error.to_string())
    }
}

/// Errors returned to callers of [`crate::client::TaskClient::submit`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubmitError {
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid request: {0}")]
    Invalid(String),
    #[error("Unsupported task type '{task_type}', registered task types: {registered:?}")]
    UnsupportedTaskType {
        task_type: String,
        registered: Vec<String>,
    },
    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigurationError {
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigurationError>;
