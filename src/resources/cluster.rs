//! # Cluster Lifecycle
//!
//! Owns the one compute cluster a worker process talks to. Initialization is
//! idempotent and serialized; shutdown always leaves the manager not-ready so the
//! next job starts from a clean slate.

use crate::error::{Result, TaskError};
use crate::logging::log_resource_operation;
use crate::models::ClusterInitConfig;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Connection to the external compute cluster.
///
/// Calls are synchronous and may block; the manager never calls them
/// concurrently.
pub trait ClusterBackend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str {
        "cluster"
    }

    fn init(&self, config: &ClusterInitConfig) -> anyhow::Result<()>;

    fn shutdown(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
struct ClusterState {
    init_duration: Option<Duration>,
    active_config: Option<ClusterInitConfig>,
}

/// Idempotent owner of the cluster handle.
pub struct ClusterManager {
    backend: Arc<dyn ClusterBackend>,
    ready: AtomicBool,
    init_count: AtomicU64,
    state: Mutex<ClusterState>,
}

impl std::fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterManager")
            .field("backend", &self.backend.name())
            .field("ready", &self.is_ready())
            .field("init_count", &self.init_count())
            .finish()
    }
}

impl ClusterManager {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        Self {
            backend,
            ready: AtomicBool::new(false),
            init_count: AtomicU64::new(0),
            state: Mutex::new(ClusterState::default()),
        }
    }

    /// Bring the cluster up, or do nothing if it already is.
    ///
    /// # Errors
    ///
    /// [`TaskError::ClusterInit`] when the backend fails or panics. The manager
    /// stays not-ready in that case.
    pub fn initialize(&self, config: &ClusterInitConfig) -> Result<()> {
        if self.ready.load(Ordering::Acquire) {
            debug!(backend = self.backend.name(), "Cluster already initialized");
            return Ok(());
        }

        let mut state = self.state.lock();
        if self.ready.load(Ordering::Acquire) {
            debug!(backend = self.backend.name(), "Cluster initialized by a concurrent caller");
            return Ok(());
        }

        info!(
            backend = self.backend.name(),
            parties = ?config.parties,
            entry_address = %config.entry_address,
            "Initializing cluster"
        );

        let start = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.backend.init(config)));
        let elapsed = start.elapsed();

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(panic) => Some(format!("cluster backend panicked: {}", panic_message(&panic))),
        };

        if let Some(reason) = failure {
            state.active_config = None;
            self.ready.store(false, Ordering::Release);
            error!(backend = self.backend.name(), error = %reason, "Cluster initialization failed");
            log_resource_operation("cluster_init", self.backend.name(), "failed", Some(elapsed), Some(&reason));
            return Err(TaskError::ClusterInit(reason));
        }

        state.init_duration = Some(elapsed);
        state.active_config = Some(config.clone());
        self.init_count.fetch_add(1, Ordering::Relaxed);
        self.ready.store(true, Ordering::Release);

        log_resource_operation("cluster_init", self.backend.name(), "ready", Some(elapsed), None);
        Ok(())
    }

    /// Tear the cluster down. Never fails; the manager is not-ready afterwards.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if !self.ready.load(Ordering::Acquire) {
            debug!(backend = self.backend.name(), "Cluster not initialized, nothing to shut down");
            return;
        }

        let start = Instant::now();
        match catch_unwind(AssertUnwindSafe(|| self.backend.shutdown())) {
            Ok(Ok(())) => {
                log_resource_operation("cluster_shutdown", self.backend.name(), "stopped", Some(start.elapsed()), None);
            }
            Ok(Err(e)) => {
                warn!(backend = self.backend.name(), error = %format!("{e:#}"), "Cluster shutdown reported an error");
            }
            Err(panic) => {
                warn!(backend = self.backend.name(), panic = %panic_message(&panic), "Cluster shutdown panicked");
            }
        }

        state.active_config = None;
        self.ready.store(false, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Duration of the most recent successful initialization.
    pub fn init_duration(&self) -> Option<Duration> {
        self.state.lock().init_duration
    }

    /// Configuration of the currently running cluster.
    pub fn active_config(&self) -> Option<ClusterInitConfig> {
        self.state.lock().active_config.clone()
    }

    /// Number of backend initializations performed since construction.
    pub fn init_count(&self) -> u64 {
        self.init_count.load(Ordering::Relaxed)
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
