//! Outcome of one orchestration run and the timing breakdown behind it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Whether the attempt produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
}

/// Per-phase timing of one run, in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_time: f64,
    pub cluster_init_time: Option<f64>,
    pub device_init_time: Option<f64>,
    pub handler_exec_time: Option<f64>,
    pub overhead_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_init_percentage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_init_percentage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler_exec_percentage: Option<f64>,
}

impl PerformanceMetrics {
    /// Build metrics from the measured phase durations.
    ///
    /// Phases that never completed are `None` and count as zero towards the
    /// overhead. Percentages are only present when the total is non-zero.
    pub fn collect(
        total: Duration,
        cluster_init: Option<Duration>,
        device_init: Option<Duration>,
        handler_exec: Option<Duration>,
    ) -> Self {
        let total_time = total.as_secs_f64();
        let cluster_init_time = cluster_init.map(|d| d.as_secs_f64());
        let device_init_time = device_init.map(|d| d.as_secs_f64());
        let handler_exec_time = handler_exec.map(|d| d.as_secs_f64());

        let accounted = cluster_init_time.unwrap_or(0.0)
            + device_init_time.unwrap_or(0.0)
            + handler_exec_time.unwrap_or(0.0);

        let percentage = |part: Option<f64>| {
            (total_time > 0.0).then(|| round_to(part.unwrap_or(0.0) / total_time * 100.0, 1))
        };

        Self {
            total_time,
            cluster_init_time,
            device_init_time,
            handler_exec_time,
            overhead_time: (total_time - accounted).max(0.0),
            cluster_init_percentage: percentage(cluster_init_time),
            device_init_percentage: percentage(device_init_time),
            handler_exec_percentage: percentage(handler_exec_time),
        }
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Identity and provenance of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub task_id: String,
    pub task_type: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub devices_used: Vec<String>,
}

/// Queue-side details attached by the consumer after the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryMetadata {
    pub message_id: String,
    pub queue: String,
    pub retry_count: u32,
    pub execution_time: f64,
    pub worker_id: String,
}

/// Final, immutable result of one successful attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: ResultStatus,
    pub result: Value,
    pub metrics: PerformanceMetrics,
    pub metadata: TaskMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryMetadata>,
}

impl TaskResult {
    pub fn success(result: Value, metrics: PerformanceMetrics, metadata: TaskMetadata) -> Self {
        Self {
            status: ResultStatus::Success,
            result,
            metrics,
            metadata,
            delivery: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    pub fn with_delivery(mut self, delivery: DeliveryMetadata) -> Self {
        self.delivery = Some(delivery);
        self
    }
}
