//! # Registry Infrastructure
//!
//! Runtime lookup of algorithm handlers by task type.

pub mod handler_registry;

pub use handler_registry::{FnHandler, HandlerContext, HandlerInfo, HandlerRegistry, TaskHandler};
