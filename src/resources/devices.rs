//! # Device Manager
//!
//! Creates the named compute devices a job needs and releases them afterwards.
//!
//! ```text
//! SecureDeviceConfig.cluster_def.nodes[].party ──→ party devices ("alice", "bob", ..)
//! SecureDeviceConfig                          ──→ "spu"
//! HomomorphicDeviceConfig                     ──→ "heu"
//! ```
//!
//! A [`DeviceSet`] is built fresh for every job and lent to the handler for the
//! duration of one dispatch.

use crate::error::{Result, TaskError};
use crate::logging::log_resource_operation;
use crate::models::{HomomorphicDeviceConfig, SecureDeviceConfig};
use crate::resources::cluster::panic_message;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Device name of the shared secure-computation device.
pub const SECURE_DEVICE: &str = "spu";
/// Device name of the homomorphic-encryption device.
pub const HOMOMORPHIC_DEVICE: &str = "heu";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Party,
    Secure,
    Homomorphic,
}

impl DeviceKind {
    /// Key used in the device init-time record.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Party => "party",
            Self::Secure => SECURE_DEVICE,
            Self::Homomorphic => HOMOMORPHIC_DEVICE,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live compute device.
pub trait DeviceHandle: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn kind(&self) -> DeviceKind;

    /// Release the device. Devices without anything to release keep the default.
    fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Factory for device handles.
pub trait DeviceBackend: Send + Sync {
    fn create_party_device(&self, party: &str) -> anyhow::Result<Arc<dyn DeviceHandle>>;

    fn create_secure_device(
        &self,
        config: &SecureDeviceConfig,
    ) -> anyhow::Result<Arc<dyn DeviceHandle>>;

    fn create_homomorphic_device(
        &self,
        config: &HomomorphicDeviceConfig,
    ) -> anyhow::Result<Arc<dyn DeviceHandle>>;
}

/// What to do when a single party device cannot be created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyFailurePolicy {
    /// Log the failure and leave the party out of the device set.
    #[default]
    Omit,
    /// Fail the whole initialization with a device configuration error.
    FailFast,
}

/// Party device settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyDeviceConfig {
    pub enabled: bool,
    pub failure_policy: PartyFailurePolicy,
}

impl Default for PartyDeviceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_policy: PartyFailurePolicy::Omit,
        }
    }
}

/// Ordered, name-unique collection of device handles.
#[derive(Clone, Default)]
pub struct DeviceSet {
    devices: BTreeMap<String, Arc<dyn DeviceHandle>>,
}

impl fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.devices.iter().map(|(name, d)| (name, d.kind())))
            .finish()
    }
}

impl DeviceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a device under its own name, returning the handle it replaced.
    pub fn insert(&mut self, device: Arc<dyn DeviceHandle>) -> Option<Arc<dyn DeviceHandle>> {
        self.devices.insert(device.name().to_string(), device)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn DeviceHandle>> {
        self.devices.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn DeviceHandle>)> {
        self.devices.iter()
    }

    pub fn secure(&self) -> Option<&Arc<dyn DeviceHandle>> {
        self.get(SECURE_DEVICE)
    }

    pub fn homomorphic(&self) -> Option<&Arc<dyn DeviceHandle>> {
        self.get(HOMOMORPHIC_DEVICE)
    }

    /// Subset restricted to party-bound devices.
    pub fn party_devices(&self) -> DeviceSet {
        self.filter(|device| device.kind() == DeviceKind::Party)
    }

    /// Device of one party, or an algorithm error naming the missing party.
    pub fn require_party(&self, party: &str) -> Result<&Arc<dyn DeviceHandle>> {
        self.devices
            .get(party)
            .filter(|device| device.kind() == DeviceKind::Party)
            .ok_or_else(|| {
                TaskError::algorithm(format!(
                    "no device available for party '{party}', available devices: {:?}",
                    self.names()
                ))
            })
    }

    /// Check every party has a device. Reports all missing parties at once.
    pub fn require_parties<I, S>(&self, parties: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let missing: Vec<String> = parties
            .into_iter()
            .filter(|party| self.require_party(party.as_ref()).is_err())
            .map(|party| party.as_ref().to_string())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(TaskError::algorithm(format!(
                "no device available for parties {missing:?}, available devices: {:?}",
                self.names()
            )))
        }
    }

    fn filter(&self, predicate: impl Fn(&Arc<dyn DeviceHandle>) -> bool) -> DeviceSet {
        DeviceSet {
            devices: self
                .devices
                .iter()
                .filter(|(_, device)| predicate(device))
                .map(|(name, device)| (name.clone(), device.clone()))
                .collect(),
        }
    }
}

#[derive(Default)]
struct DeviceState {
    devices: DeviceSet,
    init_times: HashMap<String, Duration>,
}

/// Owner of the per-job device set.
pub struct DeviceManager {
    backend: Arc<dyn DeviceBackend>,
    state: Mutex<DeviceState>,
}

impl fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceManager")
            .field("devices", &self.state.lock().devices)
            .finish()
    }
}

impl DeviceManager {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(DeviceState::default()),
        }
    }

    /// Create the devices one job needs.
    ///
    /// Parties come from the secure device node list. A party whose device cannot
    /// be created is handled according to the configured [`PartyFailurePolicy`].
    ///
    /// # Errors
    ///
    /// [`TaskError::DeviceConfig`] if a configured secure or homomorphic device
    /// cannot be created, if the fail-fast policy trips, or if no device at all
    /// was created. Handles created before the failure are released.
    pub fn initialize_devices(
        &self,
        party_config: &PartyDeviceConfig,
        secure: Option<&SecureDeviceConfig>,
        homomorphic: Option<&HomomorphicDeviceConfig>,
    ) -> Result<DeviceSet> {
        self.initialize(None, party_config, secure, homomorphic)
    }

    /// Like [`initialize_devices`](Self::initialize_devices), but only parties
    /// that are members of `cluster_parties` get a party device.
    pub fn initialize_cluster_devices(
        &self,
        cluster_parties: &[String],
        party_config: &PartyDeviceConfig,
        secure: Option<&SecureDeviceConfig>,
        homomorphic: Option<&HomomorphicDeviceConfig>,
    ) -> Result<DeviceSet> {
        self.initialize(Some(cluster_parties), party_config, secure, homomorphic)
    }

    fn initialize(
        &self,
        cluster_parties: Option<&[String]>,
        party_config: &PartyDeviceConfig,
        secure: Option<&SecureDeviceConfig>,
        homomorphic: Option<&HomomorphicDeviceConfig>,
    ) -> Result<DeviceSet> {
        let mut state = self.state.lock();
        if !state.devices.is_empty() {
            warn!(
                devices = ?state.devices.names(),
                "Releasing devices left over from a previous job"
            );
            release_all(&state.devices);
            state.devices = DeviceSet::new();
        }
        state.init_times.clear();

        let mut created = DeviceSet::new();
        let outcome = self.create_devices(
            &mut created,
            &mut state.init_times,
            cluster_parties,
            party_config,
            secure,
            homomorphic,
        );

        let outcome = outcome.and_then(|()| {
            if created.is_empty() {
                Err(TaskError::DeviceConfig(
                    "no devices were initialized for this task".to_string(),
                ))
            } else {
                Ok(())
            }
        });

        match outcome {
            Ok(()) => {
                info!(devices = ?created.names(), "Devices initialized");
                state.devices = created.clone();
                Ok(created)
            }
            Err(e) => {
                error!(error = %e, "Device initialization failed");
                release_all(&created);
                Err(e)
            }
        }
    }

    fn create_devices(
        &self,
        created: &mut DeviceSet,
        init_times: &mut HashMap<String, Duration>,
        cluster_parties: Option<&[String]>,
        party_config: &PartyDeviceConfig,
        secure: Option<&SecureDeviceConfig>,
        homomorphic: Option<&HomomorphicDeviceConfig>,
    ) -> Result<()> {
        let mut parties = secure.map(party_list).unwrap_or_default();
        if let Some(members) = cluster_parties {
            parties.retain(|party| {
                let member = members.contains(party);
                if !member {
                    warn!(party = %party, "Secure device node is not a cluster party, skipping party device");
                }
                member
            });
        }
        debug!(parties = ?parties, "Detected parties");

        if party_config.enabled && !parties.is_empty() {
            let start = Instant::now();
            let result = self.create_party_devices(created, &parties, party_config.failure_policy);
            record_time(init_times, DeviceKind::Party, start.elapsed(), result.is_ok());
            result?;
        }

        if let Some(config) = secure {
            let start = Instant::now();
            let result = config
                .validate()
                .map_err(|reason| format!("invalid secure device configuration: {reason}"))
                .and_then(|()| {
                    invoke(|| self.backend.create_secure_device(config))
                        .map_err(|reason| format!("failed to create secure device: {reason}"))
                });
            record_time(init_times, DeviceKind::Secure, start.elapsed(), result.is_ok());
            let device = result.map_err(TaskError::DeviceConfig)?;
            log_resource_operation("device_create", SECURE_DEVICE, "ready", Some(start.elapsed()), None);
            insert_named(created, SECURE_DEVICE, device);
        }

        if let Some(config) = homomorphic {
            let start = Instant::now();
            let result = config
                .validate()
                .map_err(|reason| format!("invalid homomorphic device configuration: {reason}"))
                .and_then(|()| {
                    invoke(|| self.backend.create_homomorphic_device(config))
                        .map_err(|reason| format!("failed to create homomorphic device: {reason}"))
                });
            record_time(init_times, DeviceKind::Homomorphic, start.elapsed(), result.is_ok());
            let device = result.map_err(TaskError::DeviceConfig)?;
            log_resource_operation("device_create", HOMOMORPHIC_DEVICE, "ready", Some(start.elapsed()), None);
            insert_named(created, HOMOMORPHIC_DEVICE, device);
        }

        Ok(())
    }

    fn create_party_devices(
        &self,
        created: &mut DeviceSet,
        parties: &[String],
        policy: PartyFailurePolicy,
    ) -> Result<()> {
        for party in parties {
            if party == SECURE_DEVICE || party == HOMOMORPHIC_DEVICE {
                return Err(TaskError::DeviceConfig(format!(
                    "party name '{party}' collides with a reserved device name"
                )));
            }

            match invoke(|| self.backend.create_party_device(party)) {
                Ok(device) => {
                    debug!(party = %party, "Party device created");
                    insert_named(created, party, device);
                }
                Err(reason) => match policy {
                    PartyFailurePolicy::Omit => {
                        error!(party = %party, error = %reason, "Failed to create party device, omitting party");
                    }
                    PartyFailurePolicy::FailFast => {
                        return Err(TaskError::DeviceConfig(format!(
                            "failed to create device for party '{party}': {reason}"
                        )));
                    }
                },
            }
        }
        Ok(())
    }

    /// Shut down every held device and clear all state. Never fails.
    pub fn cleanup_devices(&self) {
        let mut state = self.state.lock();
        if state.devices.is_empty() {
            debug!("No devices to clean up");
        } else {
            release_all(&state.devices);
            info!(count = state.devices.len(), "All devices cleaned up");
        }
        state.devices = DeviceSet::new();
        state.init_times.clear();
    }

    pub fn get_device(&self, name: &str) -> Option<Arc<dyn DeviceHandle>> {
        self.state.lock().devices.get(name).cloned()
    }

    pub fn get_party_devices(&self) -> DeviceSet {
        self.state.lock().devices.party_devices()
    }

    pub fn initialized_devices(&self) -> DeviceSet {
        self.state.lock().devices.clone()
    }

    /// Creation time per device kind. Failed creations are keyed `<kind>_failed`.
    pub fn device_init_times(&self) -> HashMap<String, Duration> {
        self.state.lock().init_times.clone()
    }

    pub fn device_count(&self) -> usize {
        self.state.lock().devices.len()
    }
}

/// Party names in node order, without duplicates.
fn party_list(config: &SecureDeviceConfig) -> Vec<String> {
    let mut parties: Vec<String> = Vec::new();
    for party in config.parties() {
        if !party.is_empty() && !parties.contains(&party) {
            parties.push(party);
        }
    }
    parties
}

fn invoke(
    create: impl FnOnce() -> anyhow::Result<Arc<dyn DeviceHandle>>,
) -> std::result::Result<Arc<dyn DeviceHandle>, String> {
    match catch_unwind(AssertUnwindSafe(create)) {
        Ok(Ok(device)) => Ok(device),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(panic) => Err(format!("device backend panicked: {}", panic_message(&panic))),
    }
}

fn insert_named(set: &mut DeviceSet, name: &str, device: Arc<dyn DeviceHandle>) {
    if device.name() != name {
        warn!(expected = %name, actual = %device.name(), "Device handle reports a different name");
    }
    set.devices.insert(name.to_string(), device);
}

fn record_time(
    init_times: &mut HashMap<String, Duration>,
    kind: DeviceKind,
    elapsed: Duration,
    succeeded: bool,
) {
    let key = if succeeded {
        kind.as_str().to_string()
    } else {
        format!("{}_failed", kind.as_str())
    };
    init_times.insert(key, elapsed);
}

fn release_all(devices: &DeviceSet) {
    for (name, device) in devices.iter() {
        match catch_unwind(AssertUnwindSafe(|| device.shutdown())) {
            Ok(Ok(())) => debug!(device = %name, "Device shut down"),
            Ok(Err(e)) => {
                error!(device = %name, error = %format!("{e:#}"), "Failed to clean up device");
            }
            Err(panic) => {
                error!(device = %name, panic = %panic_message(&panic), "Device shutdown panicked");
            }
        }
    }
}
