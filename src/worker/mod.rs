//! # Worker
//!
//! Queue consumption with retries and time limits around the orchestrator.
//!
//! ```text
//! worker
//! ├── bootstrap  (WorkerBuilder, Worker, WorkerHandle)
//! ├── consumer   (QueueConsumer)
//! ├── retry      (RetryPolicy)
//! └── timeout    (TimeoutWatchdog, HardTimeoutAction)
//! ```

pub mod bootstrap;
pub mod consumer;
pub mod retry;
pub mod timeout;

pub use bootstrap::{Worker, WorkerBuilder, WorkerHandle};
pub use consumer::{ConsumerHealth, ConsumerSettings, ProcessOutcome, QueueConsumer};
pub use retry::{RetryDecision, RetryPolicy};
pub use timeout::{ExitProcess, HardTimeoutAction, TimeoutPolicy, TimeoutWatchdog, WatchdogGuard};
