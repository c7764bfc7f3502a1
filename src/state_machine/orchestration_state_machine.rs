//! Tracks which phase a run is in and how long each phase took.

use super::errors::StateMachineError;
use super::states::OrchestrationState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::debug;

/// One recorded transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub from: OrchestrationState,
    pub to: OrchestrationState,
    pub at: DateTime<Utc>,
    /// Time since the state machine was created.
    pub elapsed: Duration,
}

/// Single-use state machine for one orchestration run.
#[derive(Debug)]
pub struct OrchestrationStateMachine {
    task_id: String,
    current: OrchestrationState,
    started: Instant,
    history: Vec<StateTransition>,
}

impl OrchestrationStateMachine {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            current: OrchestrationState::Started,
            started: Instant::now(),
            history: Vec::new(),
        }
    }

    pub fn current_state(&self) -> OrchestrationState {
        self.current
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// Move to `to` if the transition table allows it.
    pub fn transition(&mut self, to: OrchestrationState) -> Result<(), StateMachineError> {
        if self.current.is_terminal() {
            return Err(StateMachineError::AlreadyTerminal {
                state: self.current,
            });
        }
        if !self.current.can_transition_to(to) {
            return Err(StateMachineError::InvalidTransition {
                from: self.current,
                to,
            });
        }

        debug!(task_id = %self.task_id, from = %self.current, to = %to, "Orchestration transition");
        self.history.push(StateTransition {
            from: self.current,
            to,
            at: Utc::now(),
            elapsed: self.started.elapsed(),
        });
        self.current = to;
        Ok(())
    }

    /// Move to `Failed` from any live state. No-op once terminal.
    pub fn fail(&mut self) {
        if !self.current.is_terminal() {
            let _ = self.transition(OrchestrationState::Failed);
        }
    }
}
