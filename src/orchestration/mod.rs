//! # Orchestration
//!
//! Single-job execution: resource acquisition, handler dispatch, metrics and
//! guaranteed cleanup.

pub mod guard;
pub mod orchestrator;

pub use guard::ResourceGuard;
pub use orchestrator::TaskOrchestrator;
