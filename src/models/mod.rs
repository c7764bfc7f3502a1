//! # Data Model
//!
//! Serializable request and result types shared by the client, the queue and the
//! worker.

pub mod task_request;
pub mod task_result;

pub use task_request::{
    ClusterDef, ClusterInitConfig, DeviceConfigs, HomomorphicDeviceConfig, NodeDef,
    SecureDeviceConfig, TaskParameters, TaskRequest, LOCAL_ENTRY_ADDRESS,
};
pub use task_result::{
    DeliveryMetadata, PerformanceMetrics, ResultStatus, TaskMetadata, TaskResult,
};
