//! # Orchestration State Machine
//!
//! ```text
//! Started → ClusterInit → DeviceInit → Dispatching → CollectingMetrics → Succeeded
//!    └──────────┴─────────────┴────────────┴──────────────┴────────────→ Failed
//! ```

pub mod errors;
pub mod orchestration_state_machine;
pub mod states;

pub use errors::StateMachineError;
pub use orchestration_state_machine::{OrchestrationStateMachine, StateTransition};
pub use states::OrchestrationState;
