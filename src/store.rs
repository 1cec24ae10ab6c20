use crate::event::{DialerEvent, EventSender};
use crate::sequencer::DialerRunState;
use crate::validator::PhoneNumber;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const SNAPSHOT_FILE: &str = "dialer_snapshot.json";
const CALLER_ID_FILE: &str = "selected_caller_id.json";

/// The persisted tuple of number list + run state used to resume after
/// restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialerSnapshot {
    pub file_name: Option<String>,
    pub phone_numbers: Vec<PhoneNumber>,
    pub run_state: DialerRunState,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Durable key-value persistence for dialer progress, backed by the local
/// filesystem. Writes replace the snapshot atomically (temp file + rename) so
/// a crash mid-write never leaves a partially written record behind.
#[derive(Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub async fn load(&self) -> Result<Option<DialerSnapshot>, StoreError> {
        self.read_json(SNAPSHOT_FILE).await
    }

    pub async fn save(&self, snapshot: &DialerSnapshot) -> Result<(), StoreError> {
        self.write_json(SNAPSHOT_FILE, snapshot).await
    }

    pub async fn load_selected_caller_id(&self) -> Result<Option<PhoneNumber>, StoreError> {
        self.read_json(CALLER_ID_FILE).await
    }

    pub async fn save_selected_caller_id(&self, number: &PhoneNumber) -> Result<(), StoreError> {
        self.write_json(CALLER_ID_FILE, number).await
    }

    pub async fn clear_selected_caller_id(&self) -> Result<(), StoreError> {
        self.remove(CALLER_ID_FILE).await
    }

    /// Remove every persisted dialer key.
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.remove(SNAPSHOT_FILE).await?;
        self.remove(CALLER_ID_FILE).await?;
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        file: &str,
    ) -> Result<Option<T>, StoreError> {
        let path = self.root.join(file);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                // corrupt persisted data is recoverable, not fatal
                warn!(file, "discarding unreadable stored record: {}", e);
                Ok(None)
            }
        }
    }

    async fn write_json<T: Serialize>(&self, file: &str, value: &T) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let content = serde_json::to_string(value)?;
        let path = self.root.join(file);
        let tmp_path = self.root.join(format!("{}.tmp", file));
        tokio::fs::write(&tmp_path, content).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn remove(&self, file: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.root.join(file)).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

enum WriteOp {
    Save(DialerSnapshot),
    Clear,
}

/// Coalescing snapshot writer: a single-slot "latest pending write" queue
/// with a flush timer. Rapid successive saves within the window collapse to
/// one write, and the last queued operation always lands, including on
/// shutdown.
#[derive(Clone)]
pub struct DebouncedWriter {
    tx: mpsc::UnboundedSender<WriteOp>,
}

impl DebouncedWriter {
    pub fn new(
        store: SnapshotStore,
        window: Duration,
        cancel_token: CancellationToken,
        event_sender: Option<EventSender>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(flush_loop(store, window, cancel_token, event_sender, rx));
        Self { tx }
    }

    /// Queue a snapshot for writing. Intermediate snapshots queued within the
    /// window are superseded by later ones.
    pub fn queue(&self, snapshot: DialerSnapshot) {
        self.tx.send(WriteOp::Save(snapshot)).ok();
    }

    /// Queue removal of every persisted key. Ordered with queued saves, so a
    /// clear supersedes earlier unsettled saves instead of racing them.
    pub fn clear(&self) {
        self.tx.send(WriteOp::Clear).ok();
    }
}

async fn flush_loop(
    store: SnapshotStore,
    window: Duration,
    cancel_token: CancellationToken,
    event_sender: Option<EventSender>,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
) {
    let mut pending: Option<WriteOp> = None;
    let mut deadline = Instant::now();
    loop {
        if pending.is_none() {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                next = rx.recv() => match next {
                    Some(op) => {
                        pending = Some(op);
                        deadline = Instant::now() + window;
                    }
                    None => break,
                },
            }
        } else {
            // the deadline is fixed from the first queued write, so a
            // continuous burst still flushes every window
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {
                    if let Some(op) = pending.take() {
                        flush(&store, op, &event_sender).await;
                    }
                }
                next = rx.recv() => match next {
                    Some(op) => pending = Some(op),
                    None => break,
                },
            }
        }
    }
    // drain and flush whatever is still queued so the final state lands
    while let Ok(op) = rx.try_recv() {
        pending = Some(op);
    }
    if let Some(op) = pending {
        flush(&store, op, &event_sender).await;
    }
    debug!("snapshot writer stopped");
}

async fn flush(store: &SnapshotStore, op: WriteOp, event_sender: &Option<EventSender>) {
    let result = match op {
        WriteOp::Save(snapshot) => store.save(&snapshot).await,
        WriteOp::Clear => store.clear().await,
    };
    if let Err(e) = result {
        warn!("failed to persist dialer snapshot: {}", e);
        if let Some(sender) = event_sender {
            sender
                .send(DialerEvent::PersistenceWarning {
                    message: e.to_string(),
                    timestamp: crate::get_timestamp(),
                })
                .ok();
        }
    }
}
