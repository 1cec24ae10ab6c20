use crate::config::DialerConfig;
use crate::event::{DialerEvent, EventReceiver, EventSender};
use crate::fixtures::{CallScript, FakeCallSdk, FakeTokenProvider};
use crate::gateway::{CallGateway, CallGatewayBuilder, CallState, TOKEN_EXPIRED_CODE};
use crate::sequencer::{
    AttemptOutcome, DialerError, DialerRunState, DialerSequencer, DialerSequencerBuilder,
    DialerStatus,
};
use crate::store::{DebouncedWriter, DialerSnapshot, SnapshotStore};
use crate::validator::validate;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct TestRig {
    sequencer: DialerSequencer,
    gateway: CallGateway,
    sdk: Arc<FakeCallSdk>,
    tokens: Arc<FakeTokenProvider>,
    store: SnapshotStore,
    event_tx: EventSender,
    _dir: TempDir,
}

fn fast_config() -> DialerConfig {
    DialerConfig {
        delay_seconds: 0,
        call_duration_budget_seconds: 30,
        save_debounce_ms: 10,
    }
}

fn rig(scripts: Vec<CallScript>, numbers: &[&str], config: DialerConfig) -> TestRig {
    let dir = tempfile::tempdir().unwrap();
    let token = CancellationToken::new();
    let (event_tx, _) = tokio::sync::broadcast::channel(1024);
    let sdk = Arc::new(FakeCallSdk::new(scripts));
    let tokens = Arc::new(FakeTokenProvider::new());
    let store = SnapshotStore::new(dir.path());
    let writer = DebouncedWriter::new(
        store.clone(),
        Duration::from_millis(config.save_debounce_ms),
        token.child_token(),
        Some(event_tx.clone()),
    );
    let gateway = CallGatewayBuilder::new()
        .with_sdk(sdk.clone())
        .with_token_provider(tokens.clone())
        .with_caller_numbers(vec![validate("+15550001111").unwrap()])
        .with_event_sender(event_tx.clone())
        .with_cancel_token(token.child_token())
        .build();
    let sequencer = DialerSequencerBuilder::new()
        .with_gateway(gateway.clone())
        .with_writer(writer)
        .with_event_sender(event_tx.clone())
        .with_config(config)
        .with_cancel_token(token)
        .build();
    if !numbers.is_empty() {
        sequencer
            .load_numbers(
                numbers.iter().map(|n| validate(n).unwrap()).collect(),
                Some("numbers.csv".to_string()),
            )
            .unwrap();
    }
    TestRig {
        sequencer,
        gateway,
        sdk,
        tokens,
        store,
        event_tx,
        _dir: dir,
    }
}

async fn wait_for_idle(sequencer: &DialerSequencer) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if sequencer.run_state().status == DialerStatus::Idle {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("dialer did not reach idle in time");
}

async fn wait_for_event<F>(events: &mut EventReceiver, pred: F) -> DialerEvent
where
    F: Fn(&DialerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => break event,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
    })
    .await
    .expect("event did not arrive in time")
}

fn drain(events: &mut EventReceiver) -> Vec<DialerEvent> {
    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        collected.push(event);
    }
    collected
}

#[tokio::test]
async fn test_run_to_completion() {
    let rig = rig(
        vec![
            CallScript::Answer { hold_ms: 10 },
            CallScript::Answer { hold_ms: 10 },
        ],
        &["+15551230000", "+15551230001"],
        fast_config(),
    );
    let mut events = rig.event_tx.subscribe();

    rig.sequencer.start().await.unwrap();
    assert_eq!(rig.sequencer.run_state().status, DialerStatus::Running);
    wait_for_idle(&rig.sequencer).await;

    let state = rig.sequencer.run_state();
    assert_eq!(state.status, DialerStatus::Idle);
    assert_eq!(state.current_index, 2);
    assert_eq!(state.current_phone_number, None);
    assert_eq!(rig.sdk.connect_count(), 2);
    // no two placements are ever outstanding at once
    assert_eq!(rig.sdk.max_active(), 1);

    let completed = drain(&mut events)
        .into_iter()
        .any(|event| matches!(event, DialerEvent::RunCompleted { total: 2, .. }));
    assert!(completed);
}

#[tokio::test]
async fn test_failed_call_does_not_stall_the_run() {
    let rig = rig(
        vec![
            CallScript::Answer { hold_ms: 10 },
            CallScript::Reject { code: 31005 },
            CallScript::Answer { hold_ms: 10 },
        ],
        &["+15551230000", "+15551230001", "+15551230002"],
        fast_config(),
    );
    let mut events = rig.event_tx.subscribe();

    rig.sequencer.start().await.unwrap();
    wait_for_idle(&rig.sequencer).await;

    assert_eq!(rig.sequencer.run_state().current_index, 3);
    assert_eq!(rig.sdk.connect_count(), 3);

    let failed: Vec<usize> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            DialerEvent::AttemptFinished {
                index,
                outcome: AttemptOutcome::Failed { code, .. },
                ..
            } if code == Some(31005) => Some(index),
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec![1]);
}

#[tokio::test]
async fn test_every_call_failing_still_reaches_the_end() {
    let rig = rig(
        vec![
            CallScript::Reject { code: 31005 },
            CallScript::Reject { code: 31005 },
            CallScript::Reject { code: 31005 },
        ],
        &["+15551230000", "+15551230001", "+15551230002"],
        fast_config(),
    );

    rig.sequencer.start().await.unwrap();
    wait_for_idle(&rig.sequencer).await;

    assert_eq!(rig.sequencer.run_state().current_index, 3);
    assert_eq!(rig.sdk.connect_count(), 3);
}

#[tokio::test]
async fn test_start_with_empty_list() {
    let rig = rig(vec![], &[], fast_config());

    let result = rig.sequencer.start().await;
    assert_eq!(result, Err(DialerError::NoNumbersLoaded));
    assert_eq!(rig.sequencer.run_state().status, DialerStatus::Idle);

    let result = rig.sequencer.load_numbers(vec![], None);
    assert_eq!(result, Err(DialerError::NoNumbersLoaded));
}

#[tokio::test]
async fn test_pause_mid_call_finishes_the_call_first() {
    let rig = rig(
        vec![
            CallScript::Answer { hold_ms: 300 },
            CallScript::Answer { hold_ms: 10 },
        ],
        &["+15551230000", "+15551230001"],
        fast_config(),
    );
    let mut events = rig.event_tx.subscribe();

    rig.sequencer.start().await.unwrap();
    wait_for_event(&mut events, |event| {
        matches!(
            event,
            DialerEvent::CallProgress {
                state: CallState::Connected,
                ..
            }
        )
    })
    .await;
    rig.sequencer.pause().unwrap();

    // the in-flight call is never aborted; it runs to its terminal event and
    // the attempt is recorded
    wait_for_event(&mut events, |event| {
        matches!(event, DialerEvent::AttemptFinished { index: 0, .. })
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let state = rig.sequencer.run_state();
    assert_eq!(state.status, DialerStatus::Paused);
    assert_eq!(state.current_index, 1);
    // the next call is not placed until resume
    assert_eq!(rig.sdk.connect_count(), 1);
    let started_next = drain(&mut events)
        .into_iter()
        .any(|event| matches!(event, DialerEvent::AttemptStarted { index: 1, .. }));
    assert!(!started_next);

    rig.sequencer.resume().await.unwrap();
    wait_for_idle(&rig.sequencer).await;
    assert_eq!(rig.sequencer.run_state().current_index, 2);
    assert_eq!(rig.sdk.connect_count(), 2);
}

#[tokio::test]
async fn test_credential_failure_retries_then_succeeds() {
    let rig = rig(
        vec![
            CallScript::Reject {
                code: TOKEN_EXPIRED_CODE,
            },
            CallScript::Answer { hold_ms: 10 },
        ],
        &["+15551230000"],
        fast_config(),
    );
    let mut events = rig.event_tx.subscribe();

    rig.sequencer.start().await.unwrap();
    wait_for_idle(&rig.sequencer).await;

    assert_eq!(rig.sequencer.run_state().current_index, 1);
    assert_eq!(rig.tokens.refresh_count(), 1);
    assert_eq!(rig.sdk.connect_count(), 2);

    let outcome = drain(&mut events).into_iter().find_map(|event| match event {
        DialerEvent::AttemptFinished { index: 0, outcome, .. } => Some(outcome),
        _ => None,
    });
    assert_eq!(outcome, Some(AttemptOutcome::Completed));
}

#[tokio::test]
async fn test_credential_failure_twice_is_recorded_and_advances() {
    let rig = rig(
        vec![
            CallScript::Reject {
                code: TOKEN_EXPIRED_CODE,
            },
            CallScript::Reject {
                code: TOKEN_EXPIRED_CODE,
            },
        ],
        &["+15551230000"],
        fast_config(),
    );
    let mut events = rig.event_tx.subscribe();

    rig.sequencer.start().await.unwrap();
    wait_for_idle(&rig.sequencer).await;

    assert_eq!(rig.sequencer.run_state().current_index, 1);
    // one refresh only; the second credential failure is final
    assert_eq!(rig.tokens.refresh_count(), 1);
    assert_eq!(rig.sdk.connect_count(), 2);

    let outcome = drain(&mut events).into_iter().find_map(|event| match event {
        DialerEvent::AttemptFinished { index: 0, outcome, .. } => Some(outcome),
        _ => None,
    });
    assert_eq!(
        outcome,
        Some(AttemptOutcome::Failed {
            code: Some(TOKEN_EXPIRED_CODE),
            message: Some("connect failure".to_string()),
        })
    );
}

#[tokio::test]
async fn test_call_exceeding_budget_advances_the_sequence() {
    let config = DialerConfig {
        delay_seconds: 0,
        call_duration_budget_seconds: 1,
        save_debounce_ms: 10,
    };
    let rig = rig(vec![CallScript::Hang], &["+15551230000"], config);
    let mut events = rig.event_tx.subscribe();

    rig.sequencer.start().await.unwrap();
    wait_for_idle(&rig.sequencer).await;

    assert_eq!(rig.sequencer.run_state().current_index, 1);
    let outcome = drain(&mut events).into_iter().find_map(|event| match event {
        DialerEvent::AttemptFinished { index: 0, outcome, .. } => Some(outcome),
        _ => None,
    });
    assert_eq!(outcome, Some(AttemptOutcome::BudgetElapsed));
}

#[tokio::test]
async fn test_index_is_monotonic_across_pause_and_resume() {
    let rig = rig(
        vec![
            CallScript::Answer { hold_ms: 100 },
            CallScript::Answer { hold_ms: 100 },
            CallScript::Answer { hold_ms: 100 },
        ],
        &["+15551230000", "+15551230001", "+15551230002"],
        fast_config(),
    );
    let mut events = rig.event_tx.subscribe();

    rig.sequencer.start().await.unwrap();
    wait_for_event(&mut events, |event| {
        matches!(event, DialerEvent::AttemptFinished { index: 0, .. })
    })
    .await;
    rig.sequencer.pause().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    if rig.sequencer.run_state().status == DialerStatus::Paused {
        rig.sequencer.resume().await.unwrap();
    }
    wait_for_idle(&rig.sequencer).await;

    let started: Vec<usize> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            DialerEvent::AttemptStarted { index, .. } => Some(index),
            _ => None,
        })
        .collect();
    assert!(started.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(rig.sequencer.run_state().current_index, 3);
    assert_eq!(rig.sdk.max_active(), 1);
}

#[tokio::test]
async fn test_stop_resets_position_and_keeps_the_list() {
    let config = DialerConfig {
        delay_seconds: 1,
        call_duration_budget_seconds: 30,
        save_debounce_ms: 10,
    };
    let rig = rig(
        vec![CallScript::Answer { hold_ms: 10 }],
        &["+15551230000", "+15551230001", "+15551230002"],
        config,
    );
    let mut events = rig.event_tx.subscribe();

    rig.sequencer.start().await.unwrap();
    wait_for_event(&mut events, |event| {
        matches!(event, DialerEvent::AttemptFinished { index: 0, .. })
    })
    .await;
    // stop lands in the pacing delay before the second call
    rig.sequencer.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let state = rig.sequencer.run_state();
    assert_eq!(state.status, DialerStatus::Idle);
    assert_eq!(state.current_index, 0);
    assert_eq!(state.current_phone_number, None);
    assert_eq!(rig.sequencer.numbers().len(), 3);

    // no further calls after stop
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(rig.sdk.connect_count(), 1);
}

#[tokio::test]
async fn test_start_rejected_while_manual_call_is_active() {
    let rig = rig(
        vec![
            CallScript::Answer { hold_ms: 200 },
            CallScript::Answer { hold_ms: 10 },
        ],
        &["+15551230000"],
        fast_config(),
    );

    // a manually placed call occupies the single slot
    let manual = rig
        .gateway
        .place_call(validate("+15559998888").unwrap())
        .await
        .unwrap();
    let result = rig.sequencer.start().await;
    assert_eq!(result, Err(DialerError::CallAlreadyActive));
    assert_eq!(rig.sequencer.run_state().status, DialerStatus::Idle);

    manual.wait().await;
    rig.sequencer.start().await.unwrap();
    wait_for_idle(&rig.sequencer).await;
    assert_eq!(rig.sequencer.run_state().current_index, 1);
}

#[tokio::test]
async fn test_resume_rejected_while_external_call_is_active() {
    let config = DialerConfig {
        delay_seconds: 1,
        call_duration_budget_seconds: 30,
        save_debounce_ms: 10,
    };
    let rig = rig(
        vec![
            CallScript::Answer { hold_ms: 10 },
            CallScript::Answer { hold_ms: 150 },
            CallScript::Answer { hold_ms: 10 },
        ],
        &["+15551230000", "+15551230001"],
        config,
    );
    let mut events = rig.event_tx.subscribe();

    rig.sequencer.start().await.unwrap();
    wait_for_event(&mut events, |event| {
        matches!(event, DialerEvent::AttemptFinished { index: 0, .. })
    })
    .await;
    rig.sequencer.pause().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let manual = rig
        .gateway
        .place_call(validate("+15559998888").unwrap())
        .await
        .unwrap();
    let result = rig.sequencer.resume().await;
    assert_eq!(result, Err(DialerError::CallAlreadyActive));
    assert_eq!(rig.sequencer.run_state().status, DialerStatus::Paused);

    manual.wait().await;
    rig.sequencer.resume().await.unwrap();
    wait_for_idle(&rig.sequencer).await;
    assert_eq!(rig.sequencer.run_state().current_index, 2);
}

#[tokio::test]
async fn test_remove_number_rules() {
    let config = DialerConfig {
        delay_seconds: 1,
        call_duration_budget_seconds: 30,
        save_debounce_ms: 10,
    };
    let rig = rig(
        vec![
            CallScript::Answer { hold_ms: 50 },
            CallScript::Answer { hold_ms: 10 },
        ],
        &["+15551230000", "+15551230001", "+15551230002"],
        config,
    );
    let mut events = rig.event_tx.subscribe();

    assert_eq!(
        rig.sequencer.remove_number(5),
        Err(DialerError::IndexOutOfRange { index: 5 })
    );

    rig.sequencer.start().await.unwrap();
    wait_for_event(&mut events, |event| {
        matches!(event, DialerEvent::AttemptFinished { index: 0, .. })
    })
    .await;
    rig.sequencer.pause().unwrap();
    assert_eq!(rig.sequencer.run_state().current_index, 1);

    // at or before the current position: locked while the run is active
    assert_eq!(
        rig.sequencer.remove_number(0),
        Err(DialerError::NumberLocked { index: 0 })
    );
    assert_eq!(
        rig.sequencer.remove_number(1),
        Err(DialerError::NumberLocked { index: 1 })
    );
    // strictly after the current position: always allowed
    rig.sequencer.remove_number(2).unwrap();
    assert_eq!(rig.sequencer.numbers().len(), 2);

    rig.sequencer.resume().await.unwrap();
    wait_for_idle(&rig.sequencer).await;
    assert_eq!(rig.sequencer.run_state().current_index, 2);

    // while idle anything goes
    rig.sequencer.remove_number(0).unwrap();
    assert_eq!(rig.sequencer.numbers().len(), 1);
}

#[tokio::test]
async fn test_final_state_is_persisted() {
    let rig = rig(
        vec![
            CallScript::Answer { hold_ms: 10 },
            CallScript::Answer { hold_ms: 10 },
        ],
        &["+15551230000", "+15551230001"],
        fast_config(),
    );

    rig.sequencer.start().await.unwrap();
    wait_for_idle(&rig.sequencer).await;
    // let the debounced write settle
    tokio::time::sleep(Duration::from_millis(60)).await;

    let snapshot = rig.store.load().await.unwrap().expect("snapshot missing");
    assert_eq!(snapshot, rig.sequencer.snapshot());
    assert_eq!(snapshot.run_state.status, DialerStatus::Idle);
    assert_eq!(snapshot.run_state.current_index, 2);
    assert_eq!(snapshot.file_name.as_deref(), Some("numbers.csv"));
    assert_eq!(snapshot.phone_numbers.len(), 2);
}

#[tokio::test]
async fn test_restore_maps_running_to_paused_and_clamps_index() {
    let rig = rig(vec![], &[], fast_config());

    let snapshot = DialerSnapshot {
        file_name: Some("numbers.csv".to_string()),
        phone_numbers: vec![
            validate("+15551230000").unwrap(),
            validate("+15551230001").unwrap(),
        ],
        run_state: DialerRunState {
            status: DialerStatus::Running,
            current_index: 5,
            current_phone_number: None,
            delay_seconds: 2,
            call_duration_budget_seconds: 60,
        },
    };
    rig.sequencer.restore(snapshot);

    let state = rig.sequencer.run_state();
    // a run interrupted by shutdown never resumes dialing on its own
    assert_eq!(state.status, DialerStatus::Paused);
    assert_eq!(state.current_index, 2);
    assert_eq!(state.delay_seconds, 2);
    assert_eq!(rig.sequencer.numbers().len(), 2);
    assert_eq!(rig.sdk.connect_count(), 0);
}

#[tokio::test]
async fn test_clear_numbers_wipes_persisted_state() {
    let rig = rig(vec![], &["+15551230000"], fast_config());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rig.store.load().await.unwrap().is_some());

    rig.sequencer.clear_numbers();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(rig.store.load().await.unwrap(), None);
    assert_eq!(rig.sequencer.numbers().len(), 0);
    assert_eq!(rig.sequencer.run_state().status, DialerStatus::Idle);
}
