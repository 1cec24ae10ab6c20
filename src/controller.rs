use crate::gateway::{CallGateway, CallerIdPolicy, ProvisioningClient};
use crate::sequencer::{DialerError, DialerRunState, DialerSequencer};
use crate::store::{SnapshotStore, StoreError};
use crate::validator::{self, PhoneNumber};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything the action surface needs to render the dialer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DialerView {
    pub file_name: Option<String>,
    pub phone_numbers: Vec<PhoneNumber>,
    pub total: usize,
    pub run_state: DialerRunState,
    pub call_active: bool,
    pub caller_id_policy: CallerIdPolicy,
}

/// Thin glue between the action surface and the sequencer/store/gateway.
#[derive(Clone)]
pub struct DialerController {
    sequencer: DialerSequencer,
    store: SnapshotStore,
    gateway: CallGateway,
    provisioner: Option<Arc<ProvisioningClient>>,
}

impl DialerController {
    pub fn new(
        sequencer: DialerSequencer,
        store: SnapshotStore,
        gateway: CallGateway,
        provisioner: Option<Arc<ProvisioningClient>>,
    ) -> Self {
        Self {
            sequencer,
            store,
            gateway,
            provisioner,
        }
    }

    /// Rehydrate persisted state and fetch the caller-number inventory.
    /// Called once at startup; everything in here is recoverable.
    pub async fn initialize(&self) {
        match self.store.load().await {
            Ok(Some(snapshot)) => self.sequencer.restore(snapshot),
            Ok(None) => info!("no persisted dialer state"),
            Err(e) => warn!("failed to load dialer snapshot: {}", e),
        }
        match self.store.load_selected_caller_id().await {
            Ok(Some(number)) => {
                info!(number = %number, "restored selected caller number");
                self.gateway.set_policy(CallerIdPolicy::Fixed { number });
            }
            Ok(None) => {}
            Err(e) => warn!("failed to load selected caller number: {}", e),
        }
        if let Some(provisioner) = &self.provisioner {
            match provisioner.fetch_phone_numbers().await {
                Ok(numbers) if !numbers.is_empty() => self.gateway.set_caller_numbers(numbers),
                Ok(_) => warn!("provisioning returned no caller numbers"),
                Err(e) => warn!("failed to fetch caller numbers: {}", e),
            }
        }
    }

    pub async fn start(&self) -> Result<(), DialerError> {
        self.sequencer.start().await
    }

    pub fn pause(&self) -> Result<(), DialerError> {
        self.sequencer.pause()
    }

    pub async fn resume(&self) -> Result<(), DialerError> {
        self.sequencer.resume().await
    }

    pub fn stop(&self) {
        self.sequencer.stop()
    }

    /// Validate and load a raw number list. Entries that fail validation are
    /// dropped; loading fails only when nothing validates. Returns how many
    /// numbers were accepted.
    pub fn load_numbers(
        &self,
        raw_numbers: Vec<String>,
        file_name: Option<String>,
    ) -> Result<usize, DialerError> {
        let numbers: Vec<PhoneNumber> = raw_numbers
            .iter()
            .filter_map(|raw| validator::validate(raw).ok())
            .collect();
        if numbers.is_empty() {
            return Err(DialerError::NoNumbersLoaded);
        }
        let accepted = numbers.len();
        self.sequencer.load_numbers(numbers, file_name)?;
        Ok(accepted)
    }

    pub fn remove_number(&self, index: usize) -> Result<(), DialerError> {
        self.sequencer.remove_number(index)
    }

    pub fn clear_numbers(&self) {
        self.sequencer.clear_numbers()
    }

    pub fn set_delay(&self, seconds: u64) {
        self.sequencer.set_delay(seconds)
    }

    pub fn set_call_duration_budget(&self, seconds: u64) -> Result<(), DialerError> {
        self.sequencer.set_call_duration_budget(seconds)
    }

    /// Pin or unpin the outbound caller number. The choice is persisted under
    /// its own key so it survives restarts.
    pub async fn select_caller_id(&self, number: Option<PhoneNumber>) -> Result<(), StoreError> {
        match number {
            Some(number) => {
                self.store.save_selected_caller_id(&number).await?;
                self.gateway.set_policy(CallerIdPolicy::Fixed { number });
            }
            None => {
                self.store.clear_selected_caller_id().await?;
                self.gateway.set_policy(CallerIdPolicy::Random);
            }
        }
        Ok(())
    }

    pub fn view(&self) -> DialerView {
        let phone_numbers = self.sequencer.numbers();
        DialerView {
            file_name: self.sequencer.file_name(),
            total: phone_numbers.len(),
            phone_numbers,
            run_state: self.sequencer.run_state(),
            call_active: self.gateway.is_busy(),
            caller_id_policy: self.gateway.policy(),
        }
    }
}
