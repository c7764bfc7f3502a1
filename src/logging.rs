//! # Structured Logging Module
//!
//! Environment-aware structured logging for the worker process. Every task and
//! resource operation is logged with structured fields so a single job can be
//! followed across cluster, device and handler phases.

use crate::error::TaskError;
use chrono::Utc;
use std::io::IsTerminal;
use std::sync::OnceLock;
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Environment variable that selects the default log level.
pub const ENVIRONMENT_VAR: &str = "MPC_JOBS_ENV";

/// Environment variable that selects the console format (`json` or text).
pub const LOG_FORMAT_VAR: &str = "MPC_JOBS_LOG_FORMAT";

/// Initialize structured logging with environment-specific configuration.
///
/// `RUST_LOG` wins when set. Safe to call more than once and safe to call when
/// another subscriber is already installed.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);

        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

        let result = if json_output() {
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_filter(filter),
                )
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_level(true)
                        .with_ansi(std::io::stdout().is_terminal())
                        .with_filter(filter),
                )
                .try_init()
        };

        if result.is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            log_level = %log_level,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// `MPC_JOBS_LOG_FORMAT=json` switches the console layer to JSON lines.
fn json_output() -> bool {
    std::env::var(LOG_FORMAT_VAR).is_ok_and(|format| format.eq_ignore_ascii_case("json"))
}

/// Current environment from environment variables.
fn get_environment() -> String {
    std::env::var(ENVIRONMENT_VAR)
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Default log level for an environment.
fn get_log_level(environment: &str) -> String {
    match environment {
        "test" => "debug".to_string(),
        "development" => "debug".to_string(),
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for task operations
pub fn log_task_operation(
    operation: &str,
    task_id: &str,
    task_type: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_id = %task_id,
        task_type = task_type,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 TASK_OPERATION"
    );
}

/// Log structured data for cluster and device operations
pub fn log_resource_operation(
    operation: &str,
    resource: &str,
    status: &str,
    duration: Option<Duration>,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        resource = %resource,
        status = %status,
        duration_ms = duration.map(|d| d.as_millis() as u64),
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🔌 RESOURCE_OPERATION"
    );
}

/// Log a job failure with its taxonomy name
pub fn log_task_error(component: &str, task_id: &str, error: &TaskError, context: Option<&str>) {
    tracing::error!(
        component = %component,
        task_id = %task_id,
        error_type = error.error_type(),
        retryable = error.is_retryable(),
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ TASK_ERROR"
    );
}
