use super::states::OrchestrationState;
use thiserror::Error;

/// Errors raised by the orchestration state machine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateMachineError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: OrchestrationState,
        to: OrchestrationState,
    },

    #[error("State machine already finished in {state}")]
    AlreadyTerminal { state: OrchestrationState },
}
