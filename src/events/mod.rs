//! # Status Events
//!
//! Progress and outcome notifications for submitted jobs.

pub mod publisher;
pub mod status;

pub use publisher::{
    FanoutPublisher, InMemoryStatusChannel, JsonLinesStatusSink, StatusNotifier, StatusPublisher,
    StatusSubscription, DEFAULT_CHANNEL_CAPACITY, DEFAULT_RETAINED_TASKS,
};
pub use status::{Stage, StatusEvent, TaskStatus};
