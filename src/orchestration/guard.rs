//! RAII cleanup for the resources of one run.

use crate::logging::log_resource_operation;
use crate::resources::cluster::panic_message;
use crate::resources::{ClusterManager, DeviceManager};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// Releases devices, then the cluster, exactly once.
///
/// Created before any resource is acquired so every exit path is covered,
/// including the owning future being dropped mid-run.
#[derive(Debug)]
pub struct ResourceGuard {
    task_id: String,
    cluster: Arc<ClusterManager>,
    devices: Arc<DeviceManager>,
    released: bool,
}

impl ResourceGuard {
    pub fn new(
        task_id: impl Into<String>,
        cluster: Arc<ClusterManager>,
        devices: Arc<DeviceManager>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            cluster,
            devices,
            released: false,
        }
    }

    /// Release now instead of at drop.
    pub fn release(mut self) {
        self.cleanup();
    }

    fn cleanup(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let start = Instant::now();
        debug!(task_id = %self.task_id, "Releasing task resources");

        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.devices.cleanup_devices())) {
            error!(task_id = %self.task_id, panic = %panic_message(&panic), "Device cleanup panicked");
        }
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.cluster.shutdown())) {
            error!(task_id = %self.task_id, panic = %panic_message(&panic), "Cluster shutdown panicked");
        }

        log_resource_operation("cleanup", "task_resources", "released", Some(start.elapsed()), Some(&self.task_id));
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.cleanup();
    }
}
