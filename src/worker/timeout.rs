//! # Soft and Hard Time Limits
//!
//! Each attempt gets a watchdog on a dedicated OS thread, so it still fires when
//! the async runtime is starved by a blocking handler.
//!
//! ```text
//! arm ──── soft limit ────→ cancel token (handler sees Timeout)
//!      └── hard limit ────→ HardTimeoutAction (default: exit process)
//! disarm / drop ──────────→ thread exits, nothing fires
//! ```

use crate::config::TimeoutConfig;
use crate::error::ConfigResult;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Invoked when an attempt outlives the hard time limit.
pub trait HardTimeoutAction: Send + Sync + 'static {
    fn on_hard_timeout(&self, task_id: &str, elapsed: Duration);
}

/// Terminates the worker process. The unacknowledged message becomes visible
/// again once its visibility timeout lapses and is redelivered.
#[derive(Debug, Clone, Copy)]
pub struct ExitProcess {
    pub exit_code: i32,
}

impl Default for ExitProcess {
    fn default() -> Self {
        Self { exit_code: 70 }
    }
}

impl HardTimeoutAction for ExitProcess {
    fn on_hard_timeout(&self, task_id: &str, elapsed: Duration) {
        error!(
            task_id = %task_id,
            elapsed_secs = elapsed.as_secs_f64(),
            exit_code = self.exit_code,
            "Hard time limit exceeded, terminating worker"
        );
        std::process::exit(self.exit_code);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutPolicy {
    pub soft_limit: Duration,
    pub hard_limit: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600), Duration::from_secs(3900))
    }
}

impl TimeoutPolicy {
    pub fn new(soft_limit: Duration, hard_limit: Duration) -> Self {
        Self {
            soft_limit,
            hard_limit: hard_limit.max(soft_limit),
        }
    }

    pub fn from_config(config: &TimeoutConfig) -> ConfigResult<Self> {
        Ok(Self::new(config.soft_limit()?, config.hard_limit()?))
    }
}

/// Arms one watchdog per attempt.
#[derive(Clone)]
pub struct TimeoutWatchdog {
    policy: TimeoutPolicy,
    action: Arc<dyn HardTimeoutAction>,
}

impl std::fmt::Debug for TimeoutWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutWatchdog")
            .field("policy", &self.policy)
            .finish()
    }
}

impl TimeoutWatchdog {
    pub fn new(policy: TimeoutPolicy, action: Arc<dyn HardTimeoutAction>) -> Self {
        Self { policy, action }
    }

    pub fn policy(&self) -> TimeoutPolicy {
        self.policy
    }

    /// Start timing an attempt. The returned guard disarms on drop.
    pub fn arm(&self, task_id: &str) -> WatchdogGuard {
        let token = CancellationToken::new();
        let soft_fired = Arc::new(AtomicBool::new(false));
        let hard_fired = Arc::new(AtomicBool::new(false));
        let (disarm, disarmed) = channel::bounded::<()>(1);

        let thread = {
            let token = token.clone();
            let soft_fired = soft_fired.clone();
            let hard_fired = hard_fired.clone();
            let action = self.action.clone();
            let policy = self.policy;
            let task_id = task_id.to_string();

            std::thread::Builder::new()
                .name(format!("watchdog-{task_id}"))
                .spawn(move || {
                    let start = Instant::now();

                    match disarmed.recv_timeout(policy.soft_limit) {
                        Err(RecvTimeoutError::Timeout) => {
                            warn!(task_id = %task_id, soft_limit_secs = policy.soft_limit.as_secs_f64(), "Soft time limit exceeded");
                            soft_fired.store(true, Ordering::Release);
                            token.cancel();
                        }
                        _ => return,
                    }

                    let remaining = policy.hard_limit.saturating_sub(start.elapsed());
                    if let Err(RecvTimeoutError::Timeout) = disarmed.recv_timeout(remaining) {
                        hard_fired.store(true, Ordering::Release);
                        action.on_hard_timeout(&task_id, start.elapsed());
                    }
                })
        };

        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to spawn timeout watchdog, running without time limits");
                None
            }
        };

        WatchdogGuard {
            token,
            soft_fired,
            hard_fired,
            disarm: Some(disarm),
            thread,
        }
    }
}

/// Live watchdog for one attempt.
#[derive(Debug)]
pub struct WatchdogGuard {
    token: CancellationToken,
    soft_fired: Arc<AtomicBool>,
    hard_fired: Arc<AtomicBool>,
    disarm: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl WatchdogGuard {
    /// Token cancelled at the soft limit.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn soft_limit_fired(&self) -> bool {
        self.soft_fired.load(Ordering::Acquire)
    }

    pub fn hard_limit_fired(&self) -> bool {
        self.hard_fired.load(Ordering::Acquire)
    }

    /// Stop the watchdog and wait for its thread.
    pub fn disarm(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // Dropping the sender wakes the thread with a disconnect.
        self.disarm.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                debug!("Watchdog thread panicked");
            }
        }
    }
}

impl Drop for WatchdogGuard {
    fn drop(&mut self) {
        self.stop();
    }
}
