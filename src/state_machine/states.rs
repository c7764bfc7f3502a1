use serde::{Deserialize, Serialize};
use std::fmt;

/// Phases of one orchestration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationState {
    /// Run accepted, nothing acquired yet
    Started,
    /// Bringing the cluster up
    ClusterInit,
    /// Creating party and shared devices
    DeviceInit,
    /// Handler is running
    Dispatching,
    /// Handler returned, metrics being assembled
    CollectingMetrics,
    /// Run produced a result
    Succeeded,
    /// Run ended with an error
    Failed,
}

impl OrchestrationState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// States reachable from this one.
    pub fn allowed_transitions(&self) -> &'static [OrchestrationState] {
        use OrchestrationState::*;
        match self {
            Started => &[ClusterInit, Failed],
            ClusterInit => &[DeviceInit, Failed],
            DeviceInit => &[Dispatching, Failed],
            Dispatching => &[CollectingMetrics, Failed],
            CollectingMetrics => &[Succeeded, Failed],
            Succeeded | Failed => &[],
        }
    }

    pub fn can_transition_to(&self, to: OrchestrationState) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// Stage name used in timeout reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::ClusterInit => "cluster_init",
            Self::DeviceInit => "device_init",
            Self::Dispatching => "dispatching",
            Self::CollectingMetrics => "collecting_metrics",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrchestrationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "cluster_init" => Ok(Self::ClusterInit),
            "device_init" => Ok(Self::DeviceInit),
            "dispatching" => Ok(Self::Dispatching),
            "collecting_metrics" => Ok(Self::CollectingMetrics),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid orchestration state: {s}")),
        }
    }
}
