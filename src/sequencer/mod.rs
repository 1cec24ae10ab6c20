use crate::validator::PhoneNumber;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod sequencer;
pub use sequencer::DialerSequencer;
pub use sequencer::DialerSequencerBuilder;
#[cfg(test)]
mod tests;

/// Run-level state machine of the auto dialer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialerStatus {
    Idle,
    Running,
    Paused,
}

impl Default for DialerStatus {
    fn default() -> Self {
        DialerStatus::Idle
    }
}

/// The persisted/observable run state. `current_index` is the next (or
/// in-flight) position in the number list and only moves forward except on
/// explicit stop/reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DialerRunState {
    pub status: DialerStatus,
    pub current_index: usize,
    pub current_phone_number: Option<PhoneNumber>,
    pub delay_seconds: u64,
    pub call_duration_budget_seconds: u64,
}

impl Default for DialerRunState {
    fn default() -> Self {
        Self {
            status: DialerStatus::Idle,
            current_index: 0,
            current_phone_number: None,
            delay_seconds: 1,
            call_duration_budget_seconds: 300,
        }
    }
}

/// How a single call attempt concluded, from the sequence's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The call reached `disconnected` without a failure code
    Completed,
    /// The call failed to set up or disconnected with an error
    Failed {
        code: Option<u32>,
        message: Option<String>,
    },
    /// The call-duration budget elapsed before a terminal event
    BudgetElapsed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialerError {
    #[error("no phone numbers loaded")]
    NoNumbersLoaded,
    #[error("another call is already active")]
    CallAlreadyActive,
    #[error("cannot {action} while the dialer is {status:?}")]
    InvalidTransition {
        action: &'static str,
        status: DialerStatus,
    },
    #[error("number at index {index} is at or before the current dialing position")]
    NumberLocked { index: usize },
    #[error("index {index} is out of bounds")]
    IndexOutOfRange { index: usize },
    #[error("call duration budget must be positive")]
    InvalidBudget,
}
