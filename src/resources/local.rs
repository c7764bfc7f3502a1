//! In-process cluster and device backends.
//!
//! Selected with `entry_address = "local"`. Nothing leaves the process, which
//! makes these the backends of choice for tests and single-host development.

use crate::models::{ClusterInitConfig, HomomorphicDeviceConfig, SecureDeviceConfig};
use crate::resources::cluster::ClusterBackend;
use crate::resources::devices::{
    DeviceBackend, DeviceHandle, DeviceKind, HOMOMORPHIC_DEVICE, SECURE_DEVICE,
};
use parking_lot::Mutex;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Cluster backend that runs every party inside the current process.
///
/// Non-local entry addresses must at least resolve as `host:port`.
#[derive(Debug, Default)]
pub struct LocalClusterBackend {
    running: AtomicBool,
    parties: Mutex<Vec<String>>,
}

impl LocalClusterBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn parties(&self) -> Vec<String> {
        self.parties.lock().clone()
    }
}

impl ClusterBackend for LocalClusterBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn init(&self, config: &ClusterInitConfig) -> anyhow::Result<()> {
        if !config.is_local() {
            config
                .entry_address
                .to_socket_addrs()
                .map_err(|e| anyhow::anyhow!("invalid entry address '{}': {e}", config.entry_address))?;
        }
        *self.parties.lock() = config.parties.clone();
        self.running.store(true, Ordering::Release);
        debug!(parties = ?config.parties, "Local cluster started");
        Ok(())
    }

    fn shutdown(&self) -> anyhow::Result<()> {
        self.parties.lock().clear();
        self.running.store(false, Ordering::Release);
        Ok(())
    }
}

/// Device living in the current process.
#[derive(Debug)]
pub struct LocalDevice {
    name: String,
    kind: DeviceKind,
    shut_down: AtomicBool,
    live: Option<Arc<AtomicUsize>>,
}

impl LocalDevice {
    pub fn new(name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            shut_down: AtomicBool::new(false),
            live: None,
        }
    }

    fn tracked(name: impl Into<String>, kind: DeviceKind, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self {
            live: Some(live),
            ..Self::new(name, kind)
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl DeviceHandle for LocalDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn shutdown(&self) -> anyhow::Result<()> {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            if let Some(live) = &self.live {
                live.fetch_sub(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

/// Device factory for [`LocalDevice`]s. Tracks how many are still live.
#[derive(Debug, Default)]
pub struct LocalDeviceBackend {
    live: Arc<AtomicUsize>,
}

impl LocalDeviceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Devices created and not yet shut down.
    pub fn live_devices(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl DeviceBackend for LocalDeviceBackend {
    fn create_party_device(&self, party: &str) -> anyhow::Result<Arc<dyn DeviceHandle>> {
        Ok(Arc::new(LocalDevice::tracked(
            party,
            DeviceKind::Party,
            self.live.clone(),
        )))
    }

    fn create_secure_device(
        &self,
        config: &SecureDeviceConfig,
    ) -> anyhow::Result<Arc<dyn DeviceHandle>> {
        config.validate().map_err(anyhow::Error::msg)?;
        Ok(Arc::new(LocalDevice::tracked(
            SECURE_DEVICE,
            DeviceKind::Secure,
            self.live.clone(),
        )))
    }

    fn create_homomorphic_device(
        &self,
        config: &HomomorphicDeviceConfig,
    ) -> anyhow::Result<Arc<dyn DeviceHandle>> {
        config.validate().map_err(anyhow::Error::msg)?;
        Ok(Arc::new(LocalDevice::tracked(
            HOMOMORPHIC_DEVICE,
            DeviceKind::Homomorphic,
            self.live.clone(),
        )))
    }
}
