use crate::validator::PhoneNumber;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod caller_id;
mod gateway;
pub mod provision;

pub use caller_id::CallerIdPolicy;
pub use gateway::{CallAttempt, CallGateway, CallGatewayBuilder};
pub use provision::{ProvisioningClient, TokenProvider};

/// Error code carried by a terminal event when the access token is invalid
/// or expired.
pub const TOKEN_EXPIRED_CODE: u32 = 20101;

/// Normalized call lifecycle, in the order the SDK reports it. Exactly one
/// terminal state (`Disconnected` or `ConnectFailure`) is delivered per
/// attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Connecting,
    Ringing,
    Connected,
    Reconnecting,
    Disconnected,
    ConnectFailure,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Disconnected | CallState::ConnectFailure)
    }
}

/// A lifecycle event for one call attempt. `code`/`message` are only set on
/// failure states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEvent {
    pub state: CallState,
    pub code: Option<u32>,
    pub message: Option<String>,
}

impl CallEvent {
    pub fn state(state: CallState) -> Self {
        Self {
            state,
            code: None,
            message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_credential_failure(&self) -> bool {
        self.is_terminal() && self.code == Some(TOKEN_EXPIRED_CODE)
    }
}

/// How one gateway-level attempt concluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Completed,
    Failed {
        code: Option<u32>,
        message: Option<String>,
    },
}

/// Parameters handed to the native SDK for one outbound call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialParams {
    #[serde(rename = "To")]
    pub to: PhoneNumber,
    #[serde(rename = "Caller_Id")]
    pub caller_id: PhoneNumber,
}

pub type CallEventSender = mpsc::UnboundedSender<CallEvent>;
pub type CallEventReceiver = mpsc::UnboundedReceiver<CallEvent>;

/// A live call handed back by the SDK: an id plus its event stream.
pub struct CallHandle {
    pub call_id: String,
    pub events: CallEventReceiver,
}

/// Error reported by the SDK when a connect request is rejected outright.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SdkError {
    pub code: Option<u32>,
    pub message: String,
}

impl SdkError {
    pub fn is_credential_failure(&self) -> bool {
        self.code == Some(TOKEN_EXPIRED_CODE)
    }
}

/// Boundary to the native calling SDK. The real implementation lives outside
/// this crate; the default deployment and the tests plug their own in.
#[async_trait::async_trait]
pub trait CallSdk: Send + Sync {
    async fn connect(&self, token: &str, params: &DialParams) -> Result<CallHandle, SdkError>;
}

/// Placeholder SDK used when no calling backend is wired in: every connect is
/// rejected.
pub struct UnavailableCallSdk;

#[async_trait::async_trait]
impl CallSdk for UnavailableCallSdk {
    async fn connect(&self, _token: &str, _params: &DialParams) -> Result<CallHandle, SdkError> {
        Err(SdkError {
            code: None,
            message: "no calling sdk configured".to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("another call is already active")]
    GatewayBusy,
    #[error("no outbound caller number available")]
    NoCallerNumber,
    #[error("access token unavailable: {0}")]
    Token(String),
    #[error("call setup failed: {message}")]
    Connect {
        code: Option<u32>,
        message: String,
    },
}
