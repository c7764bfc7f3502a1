use crate::error::MessagingError;
use crate::models::TaskRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Queue envelope around a [`TaskRequest`].
///
/// `message_id` is assigned on submit and survives retries, so status records
/// for every attempt of a job share it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub message_id: String,
    pub request: TaskRequest,
    #[serde(default)]
    pub retries: u32,
    pub submitted_at: DateTime<Utc>,
}

impl TaskMessage {
    pub fn new(request: TaskRequest) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            request,
            retries: 0,
            submitted_at: Utc::now(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.request.task_id
    }

    /// Copy for the next attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            retries: self.retries + 1,
            ..self.clone()
        }
    }
}

/// One delivery of a queued message.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    /// Queue-assigned id used to acknowledge this message
    pub receipt: i64,
    /// How many times the message has been handed out, this delivery included
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub payload: Value,
}

impl ReceivedMessage {
    pub fn decode(&self) -> Result<TaskMessage, MessagingError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            MessagingError::Serialization(format!("receipt {} is not a task message: {e}", self.receipt))
        })
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}
