//! # Messaging
//!
//! Queue and result storage seams plus their in-memory implementations.
//!
//! ```text
//! TaskClient ──send──→ TaskQueue ──receive──→ QueueConsumer
//!     │                                            │
//!     └──────get_status──→ ResultBackend ←──store──┘
//! ```

pub mod in_memory;
pub mod message;
pub mod queue;
pub mod result_backend;

pub use in_memory::InMemoryTaskQueue;
pub use message::{ReceivedMessage, TaskMessage};
pub use queue::TaskQueue;
pub use result_backend::{
    ErrorInfo, InMemoryResultBackend, ResultBackend, TaskState, TaskStatusInfo,
};
