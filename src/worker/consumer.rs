//! # Queue Consumer
//!
//! Pulls one message at a time, runs it through the [`TaskOrchestrator`] under a
//! timeout watchdog, then records the outcome and acknowledges.
//!
//! ```text
//! receive ─→ decode ─→ already finished? ─yes─→ ack
//!                            │no
//!                            ↓
//!            arm watchdog ─→ execute ─→ success ─────────────→ store SUCCESS, ack
//!                                     └→ error ─→ retryable? ─→ re-enqueue (delay), RETRY, ack
//!                                                      └──────→ FAILURE/task_failed_final, ack
//! ```
//!
//! Acknowledgement comes last, so a worker that dies mid-job leaves the message
//! to reappear after its visibility timeout.

use super::retry::{RetryDecision, RetryPolicy};
use super::timeout::{ExitProcess, HardTimeoutAction, TimeoutPolicy, TimeoutWatchdog};
use crate::config::WorkerConfig;
use crate::error::{ConfigResult, MessagingError, TaskError};
use crate::events::{Stage, StatusNotifier, TaskStatus};
use crate::logging::{log_task_error, log_task_operation};
use crate::messaging::{
    ErrorInfo, ReceivedMessage, ResultBackend, TaskMessage, TaskQueue, TaskStatusInfo,
};
use crate::models::DeliveryMetadata;
use crate::orchestration::TaskOrchestrator;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Queue and policy settings for one consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSettings {
    pub queue_name: String,
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
    pub retry: RetryPolicy,
    pub timeouts: TimeoutPolicy,
}

impl ConsumerSettings {
    pub fn from_config(config: &WorkerConfig) -> ConfigResult<Self> {
        Ok(Self {
            queue_name: config.worker.queue_name.clone(),
            poll_interval: config.worker.poll_interval(),
            visibility_timeout: config.worker.visibility_timeout()?,
            retry: RetryPolicy::from_config(&config.retry)?,
            timeouts: TimeoutPolicy::from_config(&config.timeouts)?,
        })
    }
}

/// What happened to the message `process_next` looked at.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Nothing visible in the queue
    Idle,
    Succeeded { message_id: String },
    Retried {
        message_id: String,
        attempt: u32,
        delay: Duration,
    },
    Failed {
        message_id: String,
        error: TaskError,
        retries_exhausted: bool,
    },
    /// Redelivery of a message whose outcome is already recorded
    Duplicate { message_id: String },
    /// Payload was not a task message
    Discarded { receipt: i64, reason: String },
}

/// Snapshot for health endpoints and tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerHealth {
    pub worker_id: String,
    pub queue_name: String,
    pub cluster_ready: bool,
    pub devices_held: usize,
    pub in_flight: bool,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
}

#[derive(Debug, Default)]
struct ConsumerStats {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

/// Clears the in-flight flag however processing ends.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Single-flight, late-ack consumer of one task queue.
pub struct QueueConsumer {
    orchestrator: Arc<TaskOrchestrator>,
    queue: Arc<dyn TaskQueue>,
    results: Arc<dyn ResultBackend>,
    settings: ConsumerSettings,
    watchdog: TimeoutWatchdog,
    permit: Semaphore,
    in_flight: AtomicBool,
    stats: ConsumerStats,
}

impl std::fmt::Debug for QueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConsumer")
            .field("settings", &self.settings)
            .field("in_flight", &self.in_flight.load(Ordering::Acquire))
            .finish()
    }
}

impl QueueConsumer {
    pub fn new(
        orchestrator: Arc<TaskOrchestrator>,
        queue: Arc<dyn TaskQueue>,
        results: Arc<dyn ResultBackend>,
        settings: ConsumerSettings,
    ) -> Self {
        let watchdog = TimeoutWatchdog::new(settings.timeouts, Arc::new(ExitProcess::default()));
        Self {
            orchestrator,
            queue,
            results,
            settings,
            watchdog,
            permit: Semaphore::new(1),
            in_flight: AtomicBool::new(false),
            stats: ConsumerStats::default(),
        }
    }

    /// Replace what happens when an attempt outlives the hard time limit.
    pub fn with_hard_timeout_action(mut self, action: Arc<dyn HardTimeoutAction>) -> Self {
        self.watchdog = TimeoutWatchdog::new(self.settings.timeouts, action);
        self
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    fn notifier(&self) -> &StatusNotifier {
        self.orchestrator.notifier()
    }

    /// Poll until `shutdown` is cancelled. A job in progress is finished first.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            worker_id = self.notifier().worker_id(),
            queue = %self.settings.queue_name,
            "Queue consumer started"
        );

        while !shutdown.is_cancelled() {
            let idle = match self.process_next().await {
                Ok(ProcessOutcome::Idle) => true,
                Ok(outcome) => {
                    debug!(outcome = ?outcome, "Message processed");
                    false
                }
                Err(e) => {
                    error!(queue = %self.settings.queue_name, error = %e, "Queue operation failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                }
            }
        }

        info!(worker_id = self.notifier().worker_id(), "Queue consumer stopped");
    }

    /// Receive and fully process at most one message.
    ///
    /// # Errors
    ///
    /// Queue or result backend failures. The message is left unacknowledged in
    /// that case and will be redelivered.
    pub async fn process_next(&self) -> Result<ProcessOutcome, MessagingError> {
        let _permit = self
            .permit
            .acquire()
            .await
            .map_err(|_| MessagingError::Backend("consumer is shut down".to_string()))?;

        let Some(received) = self
            .queue
            .receive(&self.settings.queue_name, self.settings.visibility_timeout)
            .await?
        else {
            return Ok(ProcessOutcome::Idle);
        };

        let message = match received.decode() {
            Ok(message) => message,
            Err(e) => {
                error!(receipt = received.receipt, error = %e, "Discarding undecodable message");
                self.queue.ack(&self.settings.queue_name, received.receipt).await?;
                return Ok(ProcessOutcome::Discarded {
                    receipt: received.receipt,
                    reason: e.to_string(),
                });
            }
        };

        if let Some(existing) = self.results.get(&message.message_id).await? {
            if existing.ready {
                info!(
                    message_id = %message.message_id,
                    task_id = %message.task_id(),
                    state = %existing.state,
                    "Outcome already recorded, acknowledging redelivery"
                );
                self.queue.ack(&self.settings.queue_name, received.receipt).await?;
                return Ok(ProcessOutcome::Duplicate {
                    message_id: message.message_id,
                });
            }
        }

        let _in_flight = InFlight::enter(&self.in_flight);
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        self.handle(&received, message).await
    }

    async fn handle(
        &self,
        received: &ReceivedMessage,
        message: TaskMessage,
    ) -> Result<ProcessOutcome, MessagingError> {
        let task_id = message.task_id().to_string();
        let message_id = message.message_id.clone();

        info!(
            task_id = %task_id,
            message_id = %message_id,
            retries = message.retries,
            delivery_count = received.delivery_count,
            task_type = message.request.task_type_or_unknown(),
            "Processing task message"
        );
        if received.is_redelivery() {
            warn!(task_id = %task_id, delivery_count = received.delivery_count, "Message redelivered after an unfinished attempt");
        }

        self.results
            .store(TaskStatusInfo::started(&message_id, &task_id))
            .await?;

        let start = Instant::now();
        let watchdog = self.watchdog.arm(&task_id);
        let outcome = match message.request.validate() {
            Ok(()) => self.orchestrator.execute(&message.request, watchdog.token()).await,
            Err(e) => Err(e),
        };
        watchdog.disarm();
        let execution_time = start.elapsed().as_secs_f64();

        let outcome = match outcome {
            Ok(result) => {
                let result = result.with_delivery(DeliveryMetadata {
                    message_id: message_id.clone(),
                    queue: self.settings.queue_name.clone(),
                    retry_count: message.retries,
                    execution_time,
                    worker_id: self.notifier().worker_id().to_string(),
                });
                self.results
                    .store(TaskStatusInfo::succeeded(&message_id, &task_id, result))
                    .await?;
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                log_task_operation("consume", &task_id, message.request.task_parameters.task_type(), "succeeded", None);
                ProcessOutcome::Succeeded { message_id }
            }
            Err(error) => match self.settings.retry.decide(&error, message.retries) {
                RetryDecision::Retry { attempt, delay } => {
                    self.schedule_retry(&message, &error, attempt, delay, execution_time)
                        .await?;
                    ProcessOutcome::Retried {
                        message_id,
                        attempt,
                        delay,
                    }
                }
                RetryDecision::GiveUp { retries_exhausted } => {
                    self.record_failure(&message, &error, retries_exhausted, execution_time)
                        .await?;
                    ProcessOutcome::Failed {
                        message_id,
                        error,
                        retries_exhausted,
                    }
                }
            },
        };

        self.queue
            .ack(&self.settings.queue_name, received.receipt)
            .await?;
        Ok(outcome)
    }

    async fn schedule_retry(
        &self,
        message: &TaskMessage,
        error: &TaskError,
        attempt: u32,
        delay: Duration,
        execution_time: f64,
    ) -> Result<(), MessagingError> {
        let task_id = message.task_id();
        warn!(
            task_id = %task_id,
            error_type = error.error_type(),
            error = %error,
            attempt,
            max_retries = self.settings.retry.max_retries,
            delay_secs = delay.as_secs_f64(),
            "Retrying task"
        );

        self.queue
            .send(&self.settings.queue_name, &message.next_attempt(), delay)
            .await?;

        self.notifier().notify(
            task_id,
            TaskStatus::Retry,
            Stage::TaskRetrying,
            json!({
                "error": error.to_string(),
                "error_type": error.error_type(),
                "retry_count": attempt,
                "max_retries": self.settings.retry.max_retries,
                "countdown": delay.as_secs_f64(),
            }),
        );
        self.results
            .store(TaskStatusInfo::retrying(
                &message.message_id,
                task_id,
                ErrorInfo::from_error(error, attempt, false, execution_time),
            ))
            .await?;
        self.stats.retried.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn record_failure(
        &self,
        message: &TaskMessage,
        error: &TaskError,
        retries_exhausted: bool,
        execution_time: f64,
    ) -> Result<(), MessagingError> {
        let task_id = message.task_id();
        log_task_error(
            "consumer",
            task_id,
            error,
            Some(&format!(
                "failed permanently, retries={}, retries_exhausted={retries_exhausted}",
                message.retries
            )),
        );

        self.notifier().notify(
            task_id,
            TaskStatus::Failure,
            Stage::TaskFailedFinal,
            json!({
                "error": error.to_string(),
                "error_type": error.error_type(),
                "retries": message.retries,
                "retries_exhausted": retries_exhausted,
                "execution_time": execution_time,
            }),
        );
        self.results
            .store(TaskStatusInfo::failed(
                &message.message_id,
                task_id,
                ErrorInfo::from_error(error, message.retries, retries_exhausted, execution_time),
            ))
            .await?;
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        log_task_operation("consume", task_id, message.request.task_parameters.task_type(), "failed", Some(error.error_type()));
        Ok(())
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn health(&self) -> ConsumerHealth {
        ConsumerHealth {
            worker_id: self.notifier().worker_id().to_string(),
            queue_name: self.settings.queue_name.clone(),
            cluster_ready: self.orchestrator.cluster().is_ready(),
            devices_held: self.orchestrator.devices().device_count(),
            in_flight: self.is_in_flight(),
            processed: self.stats.processed.load(Ordering::Relaxed),
            succeeded: self.stats.succeeded.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            retried: self.stats.retried.load(Ordering::Relaxed),
        }
    }
}
