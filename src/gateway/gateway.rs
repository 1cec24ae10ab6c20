use super::{
    CallEvent, CallHandle, CallOutcome, CallSdk, CallState, CallerIdPolicy, DialParams,
    GatewayError, TokenProvider, UnavailableCallSdk, TOKEN_EXPIRED_CODE,
};
use crate::event::{DialerEvent, EventSender};
use crate::gateway::provision::ProvisioningClient;
use crate::validator::PhoneNumber;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// The system-wide single active-call slot. Claimed for the whole lifetime of
/// an attempt and released only at its terminal event.
#[derive(Clone)]
struct CallSlot {
    claimed: Arc<Mutex<bool>>,
    busy_tx: Arc<watch::Sender<bool>>,
}

impl CallSlot {
    fn new() -> Self {
        let (busy_tx, _) = watch::channel(false);
        Self {
            claimed: Arc::new(Mutex::new(false)),
            busy_tx: Arc::new(busy_tx),
        }
    }

    fn try_claim(&self) -> bool {
        let mut claimed = self.claimed.lock().unwrap();
        if *claimed {
            return false;
        }
        *claimed = true;
        self.busy_tx.send_replace(true);
        true
    }

    fn release(&self) {
        let mut claimed = self.claimed.lock().unwrap();
        *claimed = false;
        self.busy_tx.send_replace(false);
    }

    fn is_busy(&self) -> bool {
        *self.claimed.lock().unwrap()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.busy_tx.subscribe()
    }
}

pub struct CallGatewayBuilder {
    sdk: Option<Arc<dyn CallSdk>>,
    tokens: Option<Arc<dyn TokenProvider>>,
    caller_numbers: Vec<PhoneNumber>,
    policy: CallerIdPolicy,
    event_sender: Option<EventSender>,
    cancel_token: Option<CancellationToken>,
}

impl CallGatewayBuilder {
    pub fn new() -> Self {
        Self {
            sdk: None,
            tokens: None,
            caller_numbers: Vec::new(),
            policy: CallerIdPolicy::default(),
            event_sender: None,
            cancel_token: None,
        }
    }

    pub fn with_sdk(mut self, sdk: Arc<dyn CallSdk>) -> Self {
        self.sdk = Some(sdk);
        self
    }

    pub fn with_token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_caller_numbers(mut self, numbers: Vec<PhoneNumber>) -> Self {
        self.caller_numbers = numbers;
        self
    }

    pub fn with_policy(mut self, policy: CallerIdPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_event_sender(mut self, event_sender: EventSender) -> Self {
        self.event_sender = Some(event_sender);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn build(self) -> CallGateway {
        CallGateway {
            sdk: self.sdk.unwrap_or_else(|| Arc::new(UnavailableCallSdk)),
            tokens: self
                .tokens
                .unwrap_or_else(|| Arc::new(ProvisioningClient::new(Default::default()))),
            caller_numbers: Arc::new(RwLock::new(self.caller_numbers)),
            policy: Arc::new(RwLock::new(self.policy)),
            slot: CallSlot::new(),
            event_sender: self
                .event_sender
                .unwrap_or_else(|| tokio::sync::broadcast::channel(128).0),
            cancel_token: self.cancel_token.unwrap_or_default(),
        }
    }
}

/// Adapter between call requests and the single-call native SDK. Normalizes
/// the SDK's lifecycle events into [`CallEvent`]s with exactly one terminal
/// event per attempt, defends the single active-call slot, and retries once
/// with a fresh token on credential failure.
#[derive(Clone)]
pub struct CallGateway {
    sdk: Arc<dyn CallSdk>,
    tokens: Arc<dyn TokenProvider>,
    caller_numbers: Arc<RwLock<Vec<PhoneNumber>>>,
    policy: Arc<RwLock<CallerIdPolicy>>,
    slot: CallSlot,
    event_sender: EventSender,
    cancel_token: CancellationToken,
}

impl CallGateway {
    /// Place an outbound call. Fails with `GatewayBusy` if any call is
    /// already occupying the slot, wherever it was placed from.
    pub async fn place_call(&self, to: PhoneNumber) -> Result<CallAttempt, GatewayError> {
        if !self.slot.try_claim() {
            return Err(GatewayError::GatewayBusy);
        }
        match self.setup_call(to).await {
            Ok(attempt) => Ok(attempt),
            Err(e) => {
                self.slot.release();
                Err(e)
            }
        }
    }

    async fn setup_call(&self, to: PhoneNumber) -> Result<CallAttempt, GatewayError> {
        let caller_id = {
            let numbers = self.caller_numbers.read().unwrap();
            self.policy.read().unwrap().select(&numbers)
        }
        .ok_or(GatewayError::NoCallerNumber)?;

        let params = DialParams {
            to: to.clone(),
            caller_id: caller_id.clone(),
        };
        let token = self
            .tokens
            .access_token()
            .await
            .map_err(|e| GatewayError::Token(e.to_string()))?;

        let mut retried = false;
        let handle = match self.sdk.connect(&token, &params).await {
            Ok(handle) => handle,
            Err(e) if e.is_credential_failure() => {
                // one transparent retry with a fresh token, never recursive
                retried = true;
                let fresh = self
                    .tokens
                    .refresh_token()
                    .await
                    .map_err(|e| GatewayError::Token(e.to_string()))?;
                self.sdk
                    .connect(&fresh, &params)
                    .await
                    .map_err(|e| GatewayError::Connect {
                        code: e.code,
                        message: e.message,
                    })?
            }
            Err(e) => {
                return Err(GatewayError::Connect {
                    code: e.code,
                    message: e.message,
                })
            }
        };

        let attempt_id = Uuid::new_v4().to_string();
        info!(
            attempt_id,
            call_id = handle.call_id,
            to = %params.to,
            caller_id = %params.caller_id,
            "outbound call placed"
        );

        let (done_tx, done_rx) = oneshot::channel();
        let pump = AttemptPump {
            gateway: self.clone(),
            params,
            attempt_id: attempt_id.clone(),
            retried,
        };
        tokio::spawn(pump.run(handle, done_tx));

        Ok(CallAttempt {
            attempt_id,
            number: to,
            caller_id,
            completion: done_rx,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.slot.is_busy()
    }

    /// Suspend until the active-call slot is free.
    pub async fn wait_until_free(&self) {
        let mut busy_rx = self.slot.subscribe();
        while *busy_rx.borrow_and_update() {
            if busy_rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn set_caller_numbers(&self, numbers: Vec<PhoneNumber>) {
        *self.caller_numbers.write().unwrap() = numbers;
    }

    pub fn caller_numbers(&self) -> Vec<PhoneNumber> {
        self.caller_numbers.read().unwrap().clone()
    }

    pub fn set_policy(&self, policy: CallerIdPolicy) {
        *self.policy.write().unwrap() = policy;
    }

    pub fn policy(&self) -> CallerIdPolicy {
        self.policy.read().unwrap().clone()
    }
}

/// Forwards one attempt's SDK events to the dialer event bus, enforcing the
/// exactly-one-terminal contract, then releases the slot and resolves the
/// completion future.
struct AttemptPump {
    gateway: CallGateway,
    params: DialParams,
    attempt_id: String,
    retried: bool,
}

impl AttemptPump {
    async fn run(self, mut handle: CallHandle, done_tx: oneshot::Sender<CallOutcome>) {
        let mut retried = self.retried;
        let outcome = 'attempt: loop {
            let terminal = 'events: loop {
                tokio::select! {
                    _ = self.gateway.cancel_token.cancelled() => {
                        break 'attempt CallOutcome::Failed {
                            code: None,
                            message: Some("gateway stopped".to_string()),
                        };
                    }
                    event = handle.events.recv() => match event {
                        Some(event) => {
                            self.emit(&event);
                            if event.is_terminal() {
                                break 'events event;
                            }
                        }
                        None => {
                            // the SDK dropped the stream without a terminal
                            // event; synthesize one so the contract holds
                            let synthesized = CallEvent {
                                state: CallState::Disconnected,
                                code: None,
                                message: Some("event stream closed".to_string()),
                            };
                            self.emit(&synthesized);
                            break 'events synthesized;
                        }
                    }
                }
            };

            if terminal.is_credential_failure() && !retried {
                retried = true;
                match self.reconnect().await {
                    Ok(new_handle) => {
                        handle = new_handle;
                        continue 'attempt;
                    }
                    Err(outcome) => break 'attempt outcome,
                }
            }

            break 'attempt match terminal.state {
                CallState::Disconnected if terminal.code.is_none() => CallOutcome::Completed,
                _ => CallOutcome::Failed {
                    code: terminal.code,
                    message: terminal.message,
                },
            };
        };

        self.gateway.slot.release();
        done_tx.send(outcome).ok();
    }

    async fn reconnect(&self) -> Result<CallHandle, CallOutcome> {
        let token = match self.gateway.tokens.refresh_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!(attempt_id = self.attempt_id, "token refresh failed: {}", e);
                return Err(CallOutcome::Failed {
                    code: Some(TOKEN_EXPIRED_CODE),
                    message: Some(e.to_string()),
                });
            }
        };
        match self.gateway.sdk.connect(&token, &self.params).await {
            Ok(handle) => {
                info!(
                    attempt_id = self.attempt_id,
                    call_id = handle.call_id,
                    "call re-placed with refreshed token"
                );
                Ok(handle)
            }
            Err(e) => Err(CallOutcome::Failed {
                code: e.code,
                message: Some(e.message),
            }),
        }
    }

    fn emit(&self, event: &CallEvent) {
        self.gateway
            .event_sender
            .send(DialerEvent::CallProgress {
                attempt_id: self.attempt_id.clone(),
                state: event.state,
                code: event.code,
                timestamp: crate::get_timestamp(),
            })
            .ok();
    }
}

/// A placed call attempt. `wait` resolves exactly once, at the attempt's
/// terminal event.
pub struct CallAttempt {
    pub attempt_id: String,
    pub number: PhoneNumber,
    pub caller_id: PhoneNumber,
    completion: oneshot::Receiver<CallOutcome>,
}

impl CallAttempt {
    pub async fn wait(self) -> CallOutcome {
        self.completion.await.unwrap_or(CallOutcome::Failed {
            code: None,
            message: Some("gateway terminated".to_string()),
        })
    }
}
