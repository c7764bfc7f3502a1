//! # In-Memory Task Queue
//!
//! Queue with visibility timeout semantics held entirely in process memory.
//! Suitable for tests and single-process deployments.

use super::message::ReceivedMessage;
use super::queue::TaskQueue;
use crate::error::MessagingError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

/// Message wrapper for in-memory storage with metadata
#[derive(Debug, Clone)]
struct InMemoryMessage {
    id: i64,
    content: Value,
    enqueued_at: DateTime<Utc>,
    visible_at: DateTime<Utc>,
    delivery_count: u32,
}

/// In-memory queue storage
#[derive(Debug, Default)]
struct InMemoryQueue {
    messages: VecDeque<InMemoryMessage>,
    next_id: i64,
}

#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    queues: tokio::sync::Mutex<HashMap<String, InMemoryQueue>>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages currently claimable.
    pub async fn visible_count(&self, queue: &str) -> usize {
        let now = Utc::now();
        self.queues
            .lock()
            .await
            .get(queue)
            .map(|q| q.messages.iter().filter(|m| m.visible_at <= now).count())
            .unwrap_or(0)
    }

    /// Drop every message in a queue.
    pub async fn purge(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .await
            .get_mut(queue)
            .map(|q| {
                let purged = q.messages.len();
                q.messages.clear();
                purged
            })
            .unwrap_or(0)
    }
}

fn offset(now: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>, MessagingError> {
    let delta = chrono::Duration::from_std(delay)
        .map_err(|e| MessagingError::Backend(format!("delay out of range: {e}")))?;
    Ok(now + delta)
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn send_raw(
        &self,
        queue: &str,
        payload: Value,
        delay: Duration,
    ) -> Result<i64, MessagingError> {
        let now = Utc::now();
        let visible_at = offset(now, delay)?;

        let mut queues = self.queues.lock().await;
        let queue_state = queues.entry(queue.to_string()).or_default();

        queue_state.next_id += 1;
        let id = queue_state.next_id;
        queue_state.messages.push_back(InMemoryMessage {
            id,
            content: payload,
            enqueued_at: now,
            visible_at,
            delivery_count: 0,
        });

        debug!(queue = %queue, receipt = id, delay_ms = delay.as_millis() as u64, "Message enqueued");
        Ok(id)
    }

    async fn receive(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, MessagingError> {
        let now = Utc::now();
        let hidden_until = offset(now, visibility_timeout)?;

        let mut queues = self.queues.lock().await;
        let Some(queue_state) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let claimed = queue_state
            .messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .min_by_key(|m| (m.visible_at, m.id));

        Ok(claimed.map(|message| {
            message.visible_at = hidden_until;
            message.delivery_count += 1;
            ReceivedMessage {
                receipt: message.id,
                delivery_count: message.delivery_count,
                enqueued_at: message.enqueued_at,
                payload: message.content.clone(),
            }
        }))
    }

    async fn ack(&self, queue: &str, receipt: i64) -> Result<(), MessagingError> {
        let mut queues = self.queues.lock().await;
        let queue_state = queues
            .get_mut(queue)
            .ok_or_else(|| MessagingError::QueueNotFound(queue.to_string()))?;

        let index = queue_state
            .messages
            .iter()
            .position(|m| m.id == receipt)
            .ok_or_else(|| MessagingError::ReceiptNotFound {
                queue: queue.to_string(),
                receipt,
            })?;
        queue_state.messages.remove(index);
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<usize, MessagingError> {
        Ok(self
            .queues
            .lock()
            .await
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0))
    }
}
