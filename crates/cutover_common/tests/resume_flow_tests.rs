//! Resume Flow Tests
//!
//! End-to-end checks of the store, transitioner, detector and facade working
//! together against a scripted chain:
//!
//! 1. A fresh upgrade starts at initialized with one history entry
//! 2. Stages cannot be skipped, and the governance path runs to completion
//! 3. A saved stage is reconciled against the chain and persisted, and a
//!    reconciled terminal stage is never handed to the executor
//! 4. Clearing state removes it, and locks exclude a second holder
//!
//! ## Running
//!
//! ```bash
//! cargo test -p cutover_common --test resume_flow_tests
//! ```

use async_trait::async_trait;
use cutover_common::{
    DetectorConfig, FakeNetworkState, Mode, ProposalStatus, ResumeFacade, ResumeInput,
    ResumeOptions, Stage, StateDetector, StateStore, StateTransitioner, UpgradeError,
    UpgradeExecutor, UpgradeState,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tracing::Span;

// ============================================================================
// Helpers
// ============================================================================

/// Records which stages it was asked to execute from
#[derive(Default)]
struct RecordingExecutor {
    seen: Mutex<Vec<Stage>>,
}

#[async_trait]
impl UpgradeExecutor for RecordingExecutor {
    async fn execute(&self, state: &UpgradeState) -> cutover_common::Result<()> {
        self.seen.lock().unwrap().push(state.stage);
        Ok(())
    }
}

fn build_facade(home: &TempDir, fake: FakeNetworkState) -> (ResumeFacade, Arc<RecordingExecutor>) {
    let executor = Arc::new(RecordingExecutor::default());
    let facade = ResumeFacade::new(
        StateStore::new(home.path(), Span::none()),
        StateDetector::new(
            Arc::new(fake),
            DetectorConfig {
                halt_sample: Duration::from_millis(10),
            },
            Span::none(),
        ),
        StateTransitioner::default(),
        executor.clone(),
        Span::none(),
    );
    (facade, executor)
}

// ============================================================================
// Stage graph scenarios
// ============================================================================

#[test]
fn test_new_upgrade_starts_initialized() {
    let state = UpgradeState::new("v2.0.0", "local".parse::<Mode>().unwrap(), false);
    assert_eq!(state.stage, Stage::Initialized);
    assert_eq!(state.stage_history.len(), 1);
    assert_eq!(state.stage_history[0].from, None);
    assert_eq!(state.stage_history[0].to, Stage::Initialized);
}

#[test]
fn test_cannot_jump_to_voting() {
    let t = StateTransitioner::default();
    let mut state = UpgradeState::new("v2.0.0", Mode::Local, false);

    let err = t.transition_to(&mut state, Stage::Voting, "too early").unwrap_err();
    assert!(matches!(
        err,
        UpgradeError::InvalidTransition {
            from: Stage::Initialized,
            to: Stage::Voting
        }
    ));
    assert_eq!(state.stage_history.len(), 1);

    t.transition_to(&mut state, Stage::ProposalSubmitted, "proposal 1")
        .unwrap();
    assert_eq!(state.stage, Stage::ProposalSubmitted);
}

#[test]
fn test_governance_path_persists_each_step() {
    let home = TempDir::new().unwrap();
    let store = StateStore::new(home.path(), Span::none());
    let t = StateTransitioner::default();
    let mut state = UpgradeState::new("v2.0.0", Mode::Docker, false);

    let mut stage = state.stage;
    while let Some(next) = t.next_stage_for_gov_path(stage) {
        t.transition_to(&mut state, next, "step").unwrap();
        store.save_state(&mut state).unwrap();
        assert_eq!(store.load_state().unwrap().unwrap(), state);
        stage = next;
    }

    assert_eq!(state.stage, Stage::Completed);
    assert_eq!(state.stage_history.len(), 8);
    assert!(t.valid_transitions(Stage::Completed).is_empty());
}

// ============================================================================
// Reconciliation and resume
// ============================================================================

#[tokio::test]
async fn test_reconcile_persists_voting() {
    let home = TempDir::new().unwrap();
    let (facade, _) = build_facade(
        &home,
        FakeNetworkState::running().with_proposal(9, ProposalStatus::Voting),
    );

    let mut state = UpgradeState::new("v2.0.0", Mode::Local, false);
    facade
        .transitioner()
        .transition_to(&mut state, Stage::ProposalSubmitted, "proposal 9 submitted")
        .unwrap();
    state.proposal_id = 9;
    facade.store().save_state(&mut state).unwrap();

    facade.reconcile().await.unwrap();

    let reloaded = facade.check_state().unwrap().unwrap();
    assert_eq!(reloaded.stage, Stage::Voting);
    let last = reloaded.last_transition().unwrap();
    assert_eq!(last.from, Some(Stage::ProposalSubmitted));
    assert!(last.reason.contains("voting"));
}

#[tokio::test]
async fn test_reconcile_survives_unreachable_chain() {
    let home = TempDir::new().unwrap();
    let (facade, executor) = build_facade(&home, FakeNetworkState::unreachable());

    let mut state = UpgradeState::new("v2.0.0", Mode::Local, false);
    facade
        .transitioner()
        .transition_to(&mut state, Stage::ProposalSubmitted, "submitted")
        .unwrap();
    state.proposal_id = 2;
    facade.store().save_state(&mut state).unwrap();

    let result = facade
        .resume(&ResumeInput::default(), &ResumeOptions::default())
        .await
        .unwrap();
    assert!(result.resumed);
    assert_eq!(result.state.unwrap().stage, Stage::ProposalSubmitted);
    assert_eq!(
        *executor.seen.lock().unwrap(),
        vec![Stage::ProposalSubmitted]
    );
}

#[tokio::test]
async fn test_rejected_proposal_is_not_resumed() {
    let home = TempDir::new().unwrap();
    let (facade, executor) = build_facade(
        &home,
        FakeNetworkState::running().with_proposal(1, ProposalStatus::Rejected),
    );

    let mut state = UpgradeState::new("v2.0.0", Mode::Local, false);
    let t = facade.transitioner();
    t.transition_to(&mut state, Stage::ProposalSubmitted, "proposal 1 submitted")
        .unwrap();
    t.transition_to(&mut state, Stage::Voting, "voting opened")
        .unwrap();
    state.proposal_id = 1;
    facade.store().save_state(&mut state).unwrap();

    let result = facade
        .resume(&ResumeInput::default(), &ResumeOptions::default())
        .await
        .unwrap();
    assert!(!result.resumed);
    assert_eq!(
        result.message,
        "Previous upgrade is in terminal state: proposal_rejected"
    );
    assert_eq!(result.state.unwrap().stage, Stage::ProposalRejected);
    assert!(executor.seen.lock().unwrap().is_empty());

    // The rejection is persisted and the lock is free again
    let saved = facade.check_state().unwrap().unwrap();
    assert_eq!(saved.stage, Stage::ProposalRejected);
    assert!(facade.store().acquire_lock().is_ok());
}

#[tokio::test]
async fn test_clear_state_then_nothing_exists() {
    let home = TempDir::new().unwrap();
    let (facade, _) = build_facade(&home, FakeNetworkState::running());
    let mut state = UpgradeState::new("v2.0.0", Mode::Local, true);
    facade.store().save_state(&mut state).unwrap();

    let options = ResumeOptions {
        clear_state: true,
        ..Default::default()
    };
    let result = facade.resume(&ResumeInput::default(), &options).await.unwrap();
    assert!(!result.resumed);
    assert_eq!(result.message, "State cleared successfully");
    assert!(!facade.store().state_exists());
}

#[tokio::test]
async fn test_resume_blocked_while_locked() {
    let home = TempDir::new().unwrap();
    let (facade, executor) = build_facade(&home, FakeNetworkState::running());
    let mut state = UpgradeState::new("v2.0.0", Mode::Local, true);
    facade.store().save_state(&mut state).unwrap();
    let before = std::fs::read(facade.store().state_path()).unwrap();

    // A second store on the same home stands in for another process
    let other = StateStore::new(home.path(), Span::none());
    let held = other.acquire_lock().unwrap();

    let err = facade
        .resume(&ResumeInput::default(), &ResumeOptions::default())
        .await
        .unwrap_err();
    match err {
        UpgradeError::UpgradeInProgress {
            upgrade_name,
            stage,
            lock_path,
        } => {
            assert_eq!(lock_path, facade.store().lock_path());
            assert_eq!(upgrade_name, "v2.0.0");
            assert_eq!(stage, Stage::Initialized);
        }
        other => panic!("expected UpgradeInProgress, got {:?}", other),
    }
    assert!(executor.seen.lock().unwrap().is_empty());
    assert_eq!(std::fs::read(facade.store().state_path()).unwrap(), before);

    // Clearing also needs the lock
    let clear = ResumeOptions {
        clear_state: true,
        ..Default::default()
    };
    assert!(facade
        .resume(&ResumeInput::default(), &clear)
        .await
        .unwrap_err()
        .is_lock_conflict());

    held.release().unwrap();
    let result = facade
        .resume(&ResumeInput::default(), &ResumeOptions::default())
        .await
        .unwrap();
    assert!(result.resumed);
}

#[tokio::test]
async fn test_tampered_state_blocks_resume() {
    let home = TempDir::new().unwrap();
    let (facade, executor) = build_facade(&home, FakeNetworkState::running());
    let mut state = UpgradeState::new("v2.0.0", Mode::Local, false);
    facade.store().save_state(&mut state).unwrap();

    let path = facade.store().state_path();
    let raw = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, raw.replace("\"v2.0.0\"", "\"v9.9.9\"")).unwrap();

    let err = facade
        .resume(&ResumeInput::default(), &ResumeOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_corruption());
    assert!(err.to_string().contains("corrupted"));
    assert!(err.to_string().contains("checksum mismatch"));
    assert!(executor.seen.lock().unwrap().is_empty());
}
