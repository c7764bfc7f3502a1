#![allow(clippy::doc_markdown)] // Allow technical terms like SPU, HEU in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # MPC Jobs Core
//!
//! Single-flight queue worker for multi-party compute jobs.
//!
//! ## Overview
//!
//! A job names its parties, the devices it needs and a task type. The worker
//! pulls one job at a time off a queue, brings up the cluster, creates the
//! devices, dispatches to the registered handler and tears everything down
//! again, publishing a status event at each stage.
//!
//! ## Architecture
//!
//! ```text
//! TaskClient ──submit──→ TaskQueue ──receive──→ QueueConsumer
//!                                                   │  RetryPolicy, TimeoutWatchdog
//!                                                   ▼
//!                                            TaskOrchestrator
//!                          ClusterManager → DeviceManager → HandlerRegistry
//!                                                   │
//!                          StatusNotifier ←─────────┴────────→ ResultBackend
//! ```
//!
//! ## Module Organization
//!
//! - [`models`] - Job requests and results
//! - [`resources`] - Cluster and device lifecycle behind backend traits
//! - [`registry`] - Task type to handler mapping
//! - [`orchestration`] - Per-job phase sequencing and cleanup
//! - [`state_machine`] - Orchestration phase transitions
//! - [`events`] - Status events and publishers
//! - [`messaging`] - Queue and result backend abstractions
//! - [`worker`] - Queue consumer, retries, time limits and bootstrap
//! - [`client`] - Submission and status lookup
//! - [`config`] - Layered worker configuration
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mpc_jobs_core::config::WorkerConfig;
//! use mpc_jobs_core::models::{ClusterInitConfig, DeviceConfigs, TaskParameters};
//! use mpc_jobs_core::registry::HandlerRegistry;
//! use mpc_jobs_core::worker::WorkerBuilder;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(HandlerRegistry::new());
//! registry.register_fn("echo", |_devices, params| Ok(json!(params.fields)))?;
//!
//! let worker = WorkerBuilder::new(WorkerConfig::load(None)?)
//!     .with_registry(registry)
//!     .build()?;
//! let handle = worker.start();
//!
//! let message_id = worker
//!     .client()
//!     .submit(
//!         "job-1",
//!         ClusterInitConfig::local(["alice", "bob"]),
//!         DeviceConfigs::default(),
//!         TaskParameters::new("echo"),
//!     )
//!     .await?;
//! let status = worker.client().get_status(&message_id).await?;
//! println!("{}", status.state);
//!
//! handle.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod orchestration;
pub mod registry;
pub mod resources;
pub mod state_machine;
pub mod worker;

pub use client::{SubmitOptions, TaskClient};
pub use config::WorkerConfig;
pub use error::{
    ConfigurationError, MessagingError, RegistryError, Result, SubmitError, TaskError,
};
pub use events::{Stage, StatusEvent, TaskStatus};
pub use models::{ClusterInitConfig, DeviceConfigs, TaskParameters, TaskRequest, TaskResult};
pub use orchestration::TaskOrchestrator;
pub use registry::{HandlerContext, HandlerRegistry, TaskHandler};
pub use resources::{ClusterBackend, DeviceBackend, DeviceSet};
pub use worker::{QueueConsumer, Worker, WorkerBuilder};
