use crate::gateway::{CallEvent, CallHandle, CallSdk, CallState, DialParams, SdkError, TokenProvider};
use anyhow::Result;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Scripted behavior for one [`FakeCallSdk`] connect. Scripts are consumed in
/// order; when they run out, calls answer and hang up quickly.
#[derive(Debug, Clone)]
pub enum CallScript {
    /// connecting, ringing, connected, then disconnected after `hold_ms`
    Answer { hold_ms: u64 },
    /// connecting, then connect-failure with this code
    Reject { code: u32 },
    /// rejected outright at connect time with this code
    RefuseConnect { code: u32 },
    /// connecting, connected, then no terminal event at all
    Hang,
}

/// In-memory stand-in for the native calling SDK. Records every connect and
/// tracks how many calls were live at once.
pub struct FakeCallSdk {
    scripts: Mutex<VecDeque<CallScript>>,
    connects: Mutex<Vec<(String, DialParams)>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    next_call_id: AtomicUsize,
}

impl FakeCallSdk {
    pub fn new(scripts: Vec<CallScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            connects: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
            next_call_id: AtomicUsize::new(1),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    pub fn connects(&self) -> Vec<(String, DialParams)> {
        self.connects.lock().unwrap().clone()
    }

    /// The highest number of calls that were ever live concurrently.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CallSdk for FakeCallSdk {
    async fn connect(&self, token: &str, params: &DialParams) -> Result<CallHandle, SdkError> {
        self.connects
            .lock()
            .unwrap()
            .push((token.to_string(), params.clone()));
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CallScript::Answer { hold_ms: 10 });
        if let CallScript::RefuseConnect { code } = script {
            return Err(SdkError {
                code: Some(code),
                message: "connect refused".to_string(),
            });
        }

        let call_id = format!("CA{:04}", self.next_call_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::unbounded_channel();
        let active = self.active.clone();
        let max_active = self.max_active.clone();
        let live = active.fetch_add(1, Ordering::SeqCst) + 1;
        max_active.fetch_max(live, Ordering::SeqCst);

        tokio::spawn(async move {
            tx.send(CallEvent::state(CallState::Connecting)).ok();
            match script {
                CallScript::Answer { hold_ms } => {
                    tx.send(CallEvent::state(CallState::Ringing)).ok();
                    tx.send(CallEvent::state(CallState::Connected)).ok();
                    tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    tx.send(CallEvent::state(CallState::Disconnected)).ok();
                }
                CallScript::Reject { code } => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    tx.send(CallEvent {
                        state: CallState::ConnectFailure,
                        code: Some(code),
                        message: Some("connect failure".to_string()),
                    })
                    .ok();
                }
                CallScript::Hang => {
                    tx.send(CallEvent::state(CallState::Connected)).ok();
                    // keep the stream open without ever going terminal
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
                CallScript::RefuseConnect { .. } => unreachable!(),
            }
        });

        Ok(CallHandle {
            call_id,
            events: rx,
        })
    }
}

/// Token provider that never fails and counts refreshes.
pub struct FakeTokenProvider {
    fetches: AtomicUsize,
    refreshes: AtomicUsize,
}

impl FakeTokenProvider {
    pub fn new() -> Self {
        Self {
            fetches: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
        }
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TokenProvider for FakeTokenProvider {
    async fn access_token(&self) -> Result<String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(format!("token-{}", self.refreshes.load(Ordering::SeqCst)))
    }

    async fn refresh_token(&self) -> Result<String> {
        let generation = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("token-{}", generation))
    }
}
