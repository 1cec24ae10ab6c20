use super::{AttemptOutcome, DialerError, DialerRunState, DialerStatus};
use crate::config::DialerConfig;
use crate::event::{DialerEvent, EventSender};
use crate::gateway::{CallGateway, CallGatewayBuilder, CallOutcome, GatewayError};
use crate::store::{DebouncedWriter, DialerSnapshot, SnapshotStore};
use crate::validator::PhoneNumber;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct DialerSequencerBuilder {
    gateway: Option<CallGateway>,
    writer: Option<DebouncedWriter>,
    event_sender: Option<EventSender>,
    config: DialerConfig,
    cancel_token: Option<CancellationToken>,
}

impl DialerSequencerBuilder {
    pub fn new() -> Self {
        Self {
            gateway: None,
            writer: None,
            event_sender: None,
            config: DialerConfig::default(),
            cancel_token: None,
        }
    }

    pub fn with_gateway(mut self, gateway: CallGateway) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_writer(mut self, writer: DebouncedWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_event_sender(mut self, event_sender: EventSender) -> Self {
        self.event_sender = Some(event_sender);
        self
    }

    pub fn with_config(mut self, config: DialerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn build(self) -> DialerSequencer {
        let cancel_token = self.cancel_token.unwrap_or_default();
        let state = DialerRunState {
            delay_seconds: self.config.delay_seconds,
            call_duration_budget_seconds: self.config.call_duration_budget_seconds.max(1),
            ..Default::default()
        };
        let (status_tx, _) = watch::channel(DialerStatus::Idle);
        DialerSequencer {
            state: Arc::new(RwLock::new(state)),
            numbers: Arc::new(RwLock::new(Vec::new())),
            file_name: Arc::new(RwLock::new(None)),
            gateway: self
                .gateway
                .unwrap_or_else(|| CallGatewayBuilder::new().build()),
            writer: self.writer.unwrap_or_else(|| {
                DebouncedWriter::new(
                    SnapshotStore::new("dialer_state"),
                    Duration::from_millis(300),
                    cancel_token.child_token(),
                    None,
                )
            }),
            event_sender: self
                .event_sender
                .unwrap_or_else(|| tokio::sync::broadcast::channel(128).0),
            status_tx: Arc::new(status_tx),
            run_handle: Arc::new(Mutex::new(None)),
            cancel_token,
        }
    }
}

/// The auto-dialer state machine. Owns the run status, the position in the
/// number list and the number list itself for the duration of a run, and
/// drives the dial loop: pacing delay, slot check, call placement,
/// budget-bounded completion wait, advancement, persistence.
#[derive(Clone)]
pub struct DialerSequencer {
    state: Arc<RwLock<DialerRunState>>,
    numbers: Arc<RwLock<Vec<PhoneNumber>>>,
    file_name: Arc<RwLock<Option<String>>>,
    gateway: CallGateway,
    writer: DebouncedWriter,
    event_sender: EventSender,
    status_tx: Arc<watch::Sender<DialerStatus>>,
    run_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    cancel_token: CancellationToken,
}

impl DialerSequencer {
    /// Start a run from the top of the list. Only valid while idle, with a
    /// non-empty list and a free call slot.
    pub async fn start(&self) -> Result<(), DialerError> {
        let status = self.current_status();
        if status != DialerStatus::Idle {
            return Err(DialerError::InvalidTransition {
                action: "start",
                status,
            });
        }
        if self.numbers.read().unwrap().is_empty() {
            return Err(DialerError::NoNumbersLoaded);
        }
        if self.gateway.is_busy() {
            return Err(DialerError::CallAlreadyActive);
        }
        self.reap_finished_loop().await;

        {
            let mut state = self.state.write().unwrap();
            state.current_index = 0;
            state.current_phone_number = None;
        }
        self.set_status(DialerStatus::Running);
        self.persist();
        self.spawn_loop();
        info!(total = self.numbers.read().unwrap().len(), "auto dial started");
        Ok(())
    }

    /// Pause at the next safe point. An in-flight call is never aborted; the
    /// loop finishes it, advances past it and then stops placing calls.
    pub fn pause(&self) -> Result<(), DialerError> {
        let status = self.current_status();
        if status != DialerStatus::Running {
            return Err(DialerError::InvalidTransition {
                action: "pause",
                status,
            });
        }
        self.set_status(DialerStatus::Paused);
        self.persist();
        info!("auto dial paused");
        Ok(())
    }

    /// Continue a paused run from the current index.
    pub async fn resume(&self) -> Result<(), DialerError> {
        let status = self.current_status();
        if status != DialerStatus::Paused {
            return Err(DialerError::InvalidTransition {
                action: "resume",
                status,
            });
        }

        let previous = self.run_handle.lock().unwrap().take();
        if let Some(handle) = previous {
            if !handle.is_finished() {
                // the loop is still draining its in-flight call; flipping the
                // status back is enough, it picks the change up at the next
                // safe point
                *self.run_handle.lock().unwrap() = Some(handle);
                self.set_status(DialerStatus::Running);
                self.persist();
                return Ok(());
            }
            handle.await.ok();
        }

        if self.gateway.is_busy() {
            // an externally placed call owns the slot
            return Err(DialerError::CallAlreadyActive);
        }
        self.set_status(DialerStatus::Running);
        self.persist();
        self.spawn_loop();
        info!("auto dial resumed");
        Ok(())
    }

    /// Reset to idle. Keeps the loaded number list; an in-flight call is left
    /// to finish on its own.
    pub fn stop(&self) {
        {
            let mut state = self.state.write().unwrap();
            state.current_index = 0;
            state.current_phone_number = None;
        }
        self.set_status(DialerStatus::Idle);
        self.persist();
        info!("auto dial stopped");
    }

    pub fn set_delay(&self, seconds: u64) {
        self.state.write().unwrap().delay_seconds = seconds;
        self.persist();
    }

    pub fn set_call_duration_budget(&self, seconds: u64) -> Result<(), DialerError> {
        if seconds == 0 {
            return Err(DialerError::InvalidBudget);
        }
        self.state.write().unwrap().call_duration_budget_seconds = seconds;
        self.persist();
        Ok(())
    }

    /// Replace the number list. Only valid while idle.
    pub fn load_numbers(
        &self,
        numbers: Vec<PhoneNumber>,
        file_name: Option<String>,
    ) -> Result<(), DialerError> {
        let status = self.current_status();
        if status != DialerStatus::Idle {
            return Err(DialerError::InvalidTransition {
                action: "load numbers",
                status,
            });
        }
        if numbers.is_empty() {
            return Err(DialerError::NoNumbersLoaded);
        }
        info!(
            total = numbers.len(),
            file_name = file_name.as_deref().unwrap_or(""),
            "number list loaded"
        );
        *self.numbers.write().unwrap() = numbers;
        *self.file_name.write().unwrap() = file_name;
        {
            let mut state = self.state.write().unwrap();
            state.current_index = 0;
            state.current_phone_number = None;
        }
        self.persist();
        Ok(())
    }

    /// Remove one number. The in-flight target and anything at or before the
    /// current position cannot be removed while a run is active, so indices
    /// stay valid.
    pub fn remove_number(&self, index: usize) -> Result<(), DialerError> {
        let (status, current_index) = {
            let state = self.state.read().unwrap();
            (state.status, state.current_index)
        };
        let mut numbers = self.numbers.write().unwrap();
        if index >= numbers.len() {
            return Err(DialerError::IndexOutOfRange { index });
        }
        if status != DialerStatus::Idle && index <= current_index {
            return Err(DialerError::NumberLocked { index });
        }
        let removed = numbers.remove(index);
        drop(numbers);
        debug!(index, number = %removed, "number removed from list");
        self.persist();
        Ok(())
    }

    /// Drop the list, reset the run and remove every persisted key.
    pub fn clear_numbers(&self) {
        {
            let mut state = self.state.write().unwrap();
            state.current_index = 0;
            state.current_phone_number = None;
        }
        self.numbers.write().unwrap().clear();
        *self.file_name.write().unwrap() = None;
        self.set_status(DialerStatus::Idle);
        self.writer.clear();
        info!("number list cleared");
    }

    /// Rehydrate from a persisted snapshot. A run that was `running` at
    /// shutdown comes back `paused`: restarting never dials on its own.
    pub fn restore(&self, snapshot: DialerSnapshot) {
        let DialerSnapshot {
            file_name,
            phone_numbers,
            mut run_state,
        } = snapshot;
        if run_state.status == DialerStatus::Running {
            run_state.status = DialerStatus::Paused;
        }
        run_state.current_index = run_state.current_index.min(phone_numbers.len());
        run_state.call_duration_budget_seconds = run_state.call_duration_budget_seconds.max(1);
        info!(
            total = phone_numbers.len(),
            index = run_state.current_index,
            status = ?run_state.status,
            "dialer state restored"
        );
        *self.numbers.write().unwrap() = phone_numbers;
        *self.file_name.write().unwrap() = file_name;
        let status = run_state.status;
        *self.state.write().unwrap() = run_state;
        self.status_tx.send_replace(status);
        self.persist();
    }

    pub fn run_state(&self) -> DialerRunState {
        self.state.read().unwrap().clone()
    }

    pub fn numbers(&self) -> Vec<PhoneNumber> {
        self.numbers.read().unwrap().clone()
    }

    pub fn file_name(&self) -> Option<String> {
        self.file_name.read().unwrap().clone()
    }

    pub fn snapshot(&self) -> DialerSnapshot {
        DialerSnapshot {
            file_name: self.file_name(),
            phone_numbers: self.numbers(),
            run_state: self.run_state(),
        }
    }

    pub fn subscribe_status(&self) -> watch::Receiver<DialerStatus> {
        self.status_tx.subscribe()
    }

    fn current_status(&self) -> DialerStatus {
        self.state.read().unwrap().status
    }

    fn set_status(&self, status: DialerStatus) {
        self.state.write().unwrap().status = status;
        self.status_tx.send_replace(status);
        self.emit(DialerEvent::StatusChanged {
            status,
            timestamp: crate::get_timestamp(),
        });
    }

    fn persist(&self) {
        self.writer.queue(self.snapshot());
    }

    fn emit(&self, event: DialerEvent) {
        self.event_sender.send(event).ok();
    }

    async fn reap_finished_loop(&self) {
        let previous = self.run_handle.lock().unwrap().take();
        if let Some(handle) = previous {
            // only ever pending for the few instructions between the loop's
            // final status change and its return
            handle.await.ok();
        }
    }

    fn spawn_loop(&self) {
        let this = self.clone();
        let token = self.cancel_token.child_token();
        let handle = tokio::spawn(async move { this.run_loop(token).await });
        *self.run_handle.lock().unwrap() = Some(handle);
    }

    async fn run_loop(self, token: CancellationToken) {
        debug!("dialer loop started");
        let mut status_rx = self.status_tx.subscribe();
        loop {
            if self.current_status() != DialerStatus::Running {
                break;
            }

            let index = self.state.read().unwrap().current_index;
            let total = self.numbers.read().unwrap().len();
            if index >= total {
                {
                    let mut state = self.state.write().unwrap();
                    state.current_index = total;
                    state.current_phone_number = None;
                }
                self.set_status(DialerStatus::Idle);
                self.persist();
                self.emit(DialerEvent::RunCompleted {
                    total,
                    timestamp: crate::get_timestamp(),
                });
                info!(total, "auto dial run completed");
                break;
            }

            // a manually placed call may own the slot; never race it
            if self.gateway.is_busy() {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = self.gateway.wait_until_free() => {}
                    _ = status_rx.changed() => {}
                }
                continue;
            }

            // pacing delay, cancellable by pause/stop
            let delay = self.state.read().unwrap().delay_seconds;
            if delay > 0 {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                    _ = status_rx.changed() => continue,
                }
            }

            if self.current_status() != DialerStatus::Running {
                break;
            }

            let number = match self.numbers.read().unwrap().get(index) {
                Some(number) => number.clone(),
                // the list shrank while we waited; re-check at the top
                None => continue,
            };
            self.state.write().unwrap().current_phone_number = Some(number.clone());
            self.persist();

            let attempt = match self.gateway.place_call(number.clone()).await {
                Ok(attempt) => attempt,
                Err(GatewayError::GatewayBusy) => {
                    // lost the slot to a manual call after the check above;
                    // retry the same index once it clears
                    warn!(index, "call slot taken, waiting for it to clear");
                    continue;
                }
                Err(e) => {
                    warn!(index, number = %number, "call attempt failed: {}", e);
                    let outcome = match e {
                        GatewayError::Connect { code, message } => AttemptOutcome::Failed {
                            code,
                            message: Some(message),
                        },
                        other => AttemptOutcome::Failed {
                            code: None,
                            message: Some(other.to_string()),
                        },
                    };
                    self.advance(index, number, outcome);
                    continue;
                }
            };
            self.emit(DialerEvent::AttemptStarted {
                index,
                number: number.clone(),
                attempt_id: attempt.attempt_id.clone(),
                timestamp: crate::get_timestamp(),
            });

            let budget = Duration::from_secs(
                self.state
                    .read()
                    .unwrap()
                    .call_duration_budget_seconds
                    .max(1),
            );
            let outcome = match tokio::time::timeout(budget, attempt.wait()).await {
                Ok(CallOutcome::Completed) => AttemptOutcome::Completed,
                Ok(CallOutcome::Failed { code, message }) => {
                    AttemptOutcome::Failed { code, message }
                }
                Err(_) => {
                    warn!(index, number = %number, "call exceeded duration budget, moving on");
                    AttemptOutcome::BudgetElapsed
                }
            };
            self.advance(index, number, outcome);
        }
        debug!("dialer loop exited");
    }

    /// Record an attempt's outcome and move to the next position. Failures
    /// advance exactly like successes; nothing is re-dialed automatically.
    fn advance(&self, index: usize, number: PhoneNumber, outcome: AttemptOutcome) {
        {
            let mut state = self.state.write().unwrap();
            if state.status == DialerStatus::Idle {
                // an explicit stop reset the run while the call was draining
                return;
            }
            state.current_index = index + 1;
            state.current_phone_number = None;
        }
        match &outcome {
            AttemptOutcome::Failed { code, message } => warn!(
                index,
                number = %number,
                code = (*code).unwrap_or(0),
                message = message.as_deref().unwrap_or(""),
                "call attempt failed"
            ),
            _ => info!(index, number = %number, outcome = ?outcome, "call attempt finished"),
        }
        self.emit(DialerEvent::AttemptFinished {
            index,
            number,
            outcome,
            timestamp: crate::get_timestamp(),
        });
        self.persist();
    }
}
