//! # Compute Resources
//!
//! Cluster and device lifecycle for a single job at a time.
//!
//! ```text
//! resources
//! ├── cluster   (ClusterManager, ClusterBackend)
//! ├── devices   (DeviceManager, DeviceBackend, DeviceSet)
//! └── local     (in-process backends)
//! ```

pub mod cluster;
pub mod devices;
pub mod local;

pub use cluster::{ClusterBackend, ClusterManager};
pub use devices::{
    DeviceBackend, DeviceHandle, DeviceKind, DeviceManager, DeviceSet, PartyDeviceConfig,
    PartyFailurePolicy, HOMOMORPHIC_DEVICE, SECURE_DEVICE,
};
pub use local::{LocalClusterBackend, LocalDevice, LocalDeviceBackend};
