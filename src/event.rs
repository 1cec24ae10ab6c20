use crate::gateway::CallState;
use crate::sequencer::{AttemptOutcome, DialerStatus};
use crate::validator::PhoneNumber;
use serde::{Deserialize, Serialize};

/// DialerEvent represents the observable progress of a dialer run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DialerEvent {
    /// The run-level status changed
    StatusChanged { status: DialerStatus, timestamp: u64 },

    /// A call attempt for the number at `index` was started
    AttemptStarted {
        index: usize,
        number: PhoneNumber,
        attempt_id: String,
        timestamp: u64,
    },

    /// The in-flight call moved to a new lifecycle state
    CallProgress {
        attempt_id: String,
        state: CallState,
        code: Option<u32>,
        timestamp: u64,
    },

    /// A call attempt concluded and the sequence advanced
    AttemptFinished {
        index: usize,
        number: PhoneNumber,
        outcome: AttemptOutcome,
        timestamp: u64,
    },

    /// The run reached the end of the number list
    RunCompleted { total: usize, timestamp: u64 },

    /// A snapshot write failed; the run continues in memory only
    PersistenceWarning { message: String, timestamp: u64 },
}

/// Type alias for the event sender
pub type EventSender = tokio::sync::broadcast::Sender<DialerEvent>;

/// Type alias for the event receiver
pub type EventReceiver = tokio::sync::broadcast::Receiver<DialerEvent>;
