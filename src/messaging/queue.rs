//! Durable queue abstraction the worker consumes from.

use super::message::{ReceivedMessage, TaskMessage};
use crate::error::MessagingError;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// At-least-once queue with visibility timeouts.
///
/// A received message stays invisible for the visibility timeout and comes back
/// unless it is acknowledged first.
#[async_trait]
pub trait TaskQueue: Send + Sync + 'static {
    /// Enqueue a raw payload, visible after `delay`. Returns the receipt id.
    async fn send_raw(&self, queue: &str, payload: Value, delay: Duration)
        -> Result<i64, MessagingError>;

    /// Claim the oldest visible message, if any.
    async fn receive(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, MessagingError>;

    /// Remove a message for good.
    async fn ack(&self, queue: &str, receipt: i64) -> Result<(), MessagingError>;

    /// Messages in the queue, visible or not.
    async fn depth(&self, queue: &str) -> Result<usize, MessagingError>;

    /// Enqueue a task message, visible after `delay`.
    async fn send(
        &self,
        queue: &str,
        message: &TaskMessage,
        delay: Duration,
    ) -> Result<i64, MessagingError> {
        let payload = serde_json::to_value(message)?;
        self.send_raw(queue, payload, delay).await
    }
}
