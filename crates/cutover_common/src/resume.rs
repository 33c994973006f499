//! Resume Facade
//!
//! Answers "what happens next" for the operator commands (resume, status,
//! clear-state, force-restart). Mutating paths run under the state lock:
//!
//! ```text
//! acquire_lock -> load -> detect -> transition -> save -> execute -> release
//! ```
//!
//! Terminal states are never cleared or resumed automatically.

use crate::detector::StateDetector;
use crate::error::{Result, UpgradeError};
use crate::state::UpgradeState;
use crate::store::StateStore;
use crate::transition::StateTransitioner;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument, Span};

pub const MSG_CLEARED: &str = "State cleared successfully";
pub const MSG_STATUS: &str = "Current upgrade state";
pub const MSG_FORCE_RESTART: &str = "Starting fresh (--force-restart)";
pub const MSG_NO_STATE: &str = "No existing upgrade state found";
pub const MSG_RESUMED: &str = "Resumed upgrade";

/// Performs the actual upgrade side effects from a reconciled state
#[async_trait]
pub trait UpgradeExecutor: Send + Sync {
    async fn execute(&self, state: &UpgradeState) -> Result<()>;
}

/// Operator flags. Checked in the order clear, status, force-restart.
#[derive(Debug, Clone, Default)]
pub struct ResumeOptions {
    pub clear_state: bool,
    pub show_status: bool,
    pub force_restart: bool,
}

/// What the operator expects to be resuming
#[derive(Debug, Clone, Default)]
pub struct ResumeInput {
    pub upgrade_name: Option<String>,
    pub target_version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumeResult {
    pub resumed: bool,
    pub state: Option<UpgradeState>,
    pub message: String,
}

impl ResumeResult {
    fn idle(message: impl Into<String>) -> Self {
        Self {
            resumed: false,
            state: None,
            message: message.into(),
        }
    }
}

pub struct ResumeFacade {
    store: StateStore,
    detector: StateDetector,
    transitioner: StateTransitioner,
    executor: Arc<dyn UpgradeExecutor>,
    span: Span,
}

impl ResumeFacade {
    pub fn new(
        store: StateStore,
        detector: StateDetector,
        transitioner: StateTransitioner,
        executor: Arc<dyn UpgradeExecutor>,
        span: Span,
    ) -> Self {
        Self {
            store,
            detector,
            transitioner,
            executor,
            span,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn transitioner(&self) -> &StateTransitioner {
        &self.transitioner
    }

    /// Persisted state, or `None`. Load errors pass through unchanged.
    pub fn check_state(&self) -> Result<Option<UpgradeState>> {
        self.store.load_state()
    }

    pub fn clear_state(&self) -> Result<()> {
        self.store.delete_state()
    }

    /// Bring the saved stage in line with the chain, under the lock
    pub async fn reconcile(&self) -> Result<Option<UpgradeState>> {
        let lock = self.store.acquire_lock()?;
        let reconciled = match self.check_state()? {
            Some(state) => Some(self.reconcile_loaded(state).await?),
            None => None,
        };
        lock.release()?;
        Ok(reconciled)
    }

    /// Single-hop reconciliation of an already loaded state. Caller holds the lock.
    async fn reconcile_loaded(&self, mut state: UpgradeState) -> Result<UpgradeState> {
        let saved = state.stage;
        let detected = self.detector.detect_current_stage(Some(&state)).await?;

        let _enter = self.span.enter();
        if detected == saved {
            debug!(stage = %saved, "saved stage matches chain");
            return Ok(state);
        }

        if !self.transitioner.can_transition_for(&state, detected) {
            warn!(
                upgrade = %state.upgrade_name,
                saved = %saved,
                detected = %detected,
                "detected stage is not one step from the saved stage, keeping saved stage"
            );
            return Ok(state);
        }

        let reason = format!("reconciled: chain reports {}", detected);
        self.transitioner
            .transition_to(&mut state, detected, &reason)?;
        self.store.save_state(&mut state)?;
        info!(upgrade = %state.upgrade_name, from = %saved, to = %detected, "reconciled upgrade stage");
        Ok(state)
    }

    /// Operator entry point
    pub async fn resume(&self, input: &ResumeInput, options: &ResumeOptions) -> Result<ResumeResult> {
        if options.clear_state {
            self.with_lock(|| self.clear_state())?;
            self.log(|| info!("upgrade state cleared by operator"));
            return Ok(ResumeResult::idle(MSG_CLEARED));
        }

        if options.show_status {
            let state = self.check_state()?;
            return Ok(ResumeResult {
                resumed: false,
                state,
                message: MSG_STATUS.to_string(),
            });
        }

        if options.force_restart {
            self.with_lock(|| self.clear_state())?;
            self.log(|| info!("upgrade state discarded for a fresh start"));
            return Ok(ResumeResult::idle(MSG_FORCE_RESTART));
        }

        let lock = self.store.acquire_lock()?;

        let Some(state) = self.check_state()? else {
            return Ok(ResumeResult::idle(MSG_NO_STATE));
        };

        if state.is_terminal() {
            lock.release()?;
            return Ok(self.terminal_result(state));
        }

        check_input(input, &state)?;

        let state = self.reconcile_loaded(state).await?;
        // Reconciliation may itself land on a terminal stage, e.g. a rejected proposal
        if state.is_terminal() {
            lock.release()?;
            return Ok(self.terminal_result(state));
        }

        self.executor
            .execute(&state)
            .instrument(self.span.clone())
            .await?;
        lock.release()?;

        Ok(ResumeResult {
            resumed: true,
            message: format!("{} '{}' at stage {}", MSG_RESUMED, state.upgrade_name, state.stage),
            state: Some(state),
        })
    }

    fn terminal_result(&self, state: UpgradeState) -> ResumeResult {
        self.log(|| {
            info!(
                upgrade = %state.upgrade_name,
                stage = %state.stage,
                "previous upgrade is terminal, not resuming"
            )
        });
        ResumeResult {
            resumed: false,
            message: format!("Previous upgrade is in terminal state: {}", state.stage),
            state: Some(state),
        }
    }

        fn with_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.store.acquire_lock()?;
        let value = f()?;
        lock.release()?;
        Ok(value)
    }

    fn log(&self, f: impl FnOnce()) {
        let _enter = self.span.enter();
        f();
    }
}

/// Refuse to resume a different upgrade than the one asked for
fn check_input(input: &ResumeInput, state: &UpgradeState) -> Result<()> {
    if let Some(name) = input.upgrade_name.as_deref().filter(|n| !n.is_empty()) {
        if name != state.upgrade_name {
            return Err(UpgradeError::StateMismatch {
                expected: name.to_string(),
                found: state.upgrade_name.clone(),
            });
        }
    }
    if let Some(version) = input.target_version.as_deref().filter(|v| !v.is_empty()) {
        if !state.target_version.is_empty() && version != state.target_version {
            return Err(UpgradeError::StateMismatch {
                expected: version.to_string(),
                found: state.target_version.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorConfig;
    use crate::network::{FakeNetworkState, ProposalStatus};
    use crate::state::{Mode, Stage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UpgradeExecutor for CountingExecutor {
        async fn execute(&self, _state: &UpgradeState) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn facade(temp: &TempDir, fake: FakeNetworkState) -> (ResumeFacade, Arc<CountingExecutor>) {
        let executor = Arc::new(CountingExecutor::default());
        let facade = ResumeFacade::new(
            StateStore::new(temp.path(), Span::none()),
            StateDetector::new(
                Arc::new(fake),
                DetectorConfig {
                    halt_sample: Duration::from_millis(5),
                },
                Span::none(),
            ),
            StateTransitioner::default(),
            executor.clone(),
            Span::none(),
        );
        (facade, executor)
    }

    fn saved_at(facade: &ResumeFacade, stage: Stage, proposal_id: u64) -> UpgradeState {
        let mut state = UpgradeState::new("v2.0.0", Mode::Local, false);
        if stage != Stage::Initialized {
            facade
                .transitioner()
                .transition_to(&mut state, Stage::ProposalSubmitted, "submitted")
                .unwrap();
        }
        if stage == Stage::Voting {
            facade
                .transitioner()
                .transition_to(&mut state, Stage::Voting, "voting")
                .unwrap();
        }
        state.proposal_id = proposal_id;
        facade.store().save_state(&mut state).unwrap();
        state
    }

    #[tokio::test]
    async fn test_reconcile_without_state() {
        let temp = TempDir::new().unwrap();
        let (facade, _) = facade(&temp, FakeNetworkState::running());
        assert!(facade.reconcile().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reconcile_advances_to_voting() {
        let temp = TempDir::new().unwrap();
        let (facade, _) = facade(
            &temp,
            FakeNetworkState::running().with_proposal(1, ProposalStatus::Voting),
        );
        saved_at(&facade, Stage::ProposalSubmitted, 1);

        let state = facade.reconcile().await.unwrap().expect("state");
        assert_eq!(state.stage, Stage::Voting);

        let persisted = facade.check_state().unwrap().expect("persisted");
        assert_eq!(persisted.stage, Stage::Voting);
        assert_eq!(persisted.stage_history.len(), 3);
    }

    #[tokio::test]
    async fn test_reconcile_keeps_stage_on_multi_hop() {
        let temp = TempDir::new().unwrap();
        let (facade, _) = facade(
            &temp,
            FakeNetworkState::running().with_proposal(1, ProposalStatus::Rejected),
        );
        let saved = saved_at(&facade, Stage::ProposalSubmitted, 1);

        let state = facade.reconcile().await.unwrap().expect("state");
        assert_eq!(state, saved);
    }

    #[tokio::test]
    async fn test_resume_clear_state() {
        let temp = TempDir::new().unwrap();
        let (facade, _) = facade(&temp, FakeNetworkState::running());
        saved_at(&facade, Stage::Initialized, 0);

        let options = ResumeOptions {
            clear_state: true,
            ..Default::default()
        };
        let result = facade.resume(&ResumeInput::default(), &options).await.unwrap();
        assert!(!result.resumed);
        assert_eq!(result.message, MSG_CLEARED);
        assert!(!facade.store().state_exists());
    }

    #[tokio::test]
    async fn test_resume_show_status_does_not_lock() {
        let temp = TempDir::new().unwrap();
        let (facade, _) = facade(&temp, FakeNetworkState::running());
        let saved = saved_at(&facade, Stage::Initialized, 0);
        let _held = facade.store().acquire_lock().unwrap();

        let options = ResumeOptions {
            show_status: true,
            ..Default::default()
        };
        let result = facade.resume(&ResumeInput::default(), &options).await.unwrap();
        assert!(!result.resumed);
        assert_eq!(result.message, MSG_STATUS);
        assert_eq!(result.state, Some(saved));
    }

    #[tokio::test]
    async fn test_resume_force_restart() {
        let temp = TempDir::new().unwrap();
        let (facade, _) = facade(&temp, FakeNetworkState::running());
        saved_at(&facade, Stage::Voting, 1);

        let options = ResumeOptions {
            force_restart: true,
            ..Default::default()
        };
        let result = facade.resume(&ResumeInput::default(), &options).await.unwrap();
        assert_eq!(result.message, MSG_FORCE_RESTART);
        assert!(!facade.store().state_exists());
    }

    #[tokio::test]
    async fn test_resume_no_state() {
        let temp = TempDir::new().unwrap();
        let (facade, executor) = facade(&temp, FakeNetworkState::running());
        let result = facade
            .resume(&ResumeInput::default(), &ResumeOptions::default())
            .await
            .unwrap();
        assert!(!result.resumed);
        assert_eq!(result.message, MSG_NO_STATE);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resume_terminal_state_is_left_alone() {
        let temp = TempDir::new().unwrap();
        let (facade, executor) = facade(&temp, FakeNetworkState::running());
        let mut state = saved_at(&facade, Stage::ProposalSubmitted, 0);
        facade
            .transitioner()
            .transition_to(&mut state, Stage::Failed, "node crashed")
            .unwrap();
        facade.store().save_state(&mut state).unwrap();

        let result = facade
            .resume(&ResumeInput::default(), &ResumeOptions::default())
            .await
            .unwrap();
        assert!(!result.resumed);
        assert_eq!(result.message, "Previous upgrade is in terminal state: failed");
        assert!(facade.store().state_exists());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resume_reconciles_and_executes() {
        let temp = TempDir::new().unwrap();
        let (facade, executor) = facade(
            &temp,
            FakeNetworkState::running().with_proposal(4, ProposalStatus::Voting),
        );
        saved_at(&facade, Stage::ProposalSubmitted, 4);

        let input = ResumeInput {
            upgrade_name: Some("v2.0.0".to_string()),
            target_version: None,
        };
        let result = facade.resume(&input, &ResumeOptions::default()).await.unwrap();
        assert!(result.resumed);
        assert_eq!(result.state.unwrap().stage, Stage::Voting);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert!(!facade.store().lock_path().exists());
    }

    #[tokio::test]
    async fn test_resume_refuses_other_upgrade() {
        let temp = TempDir::new().unwrap();
        let (facade, executor) = facade(&temp, FakeNetworkState::running());
        saved_at(&facade, Stage::Initialized, 0);

        let input = ResumeInput {
            upgrade_name: Some("v3.0.0".to_string()),
            target_version: None,
        };
        let err = facade
            .resume(&input, &ResumeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UpgradeError::StateMismatch { .. }));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        // Lock released on the error path
        assert!(facade.store().acquire_lock().is_ok());
    }

    #[tokio::test]
    async fn test_resume_corrupted_state() {
        let temp = TempDir::new().unwrap();
        let (facade, _) = facade(&temp, FakeNetworkState::running());
        std::fs::write(facade.store().state_path(), "garbage").unwrap();

        let err = facade
            .resume(&ResumeInput::default(), &ResumeOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("corrupted"));
        assert!(facade.store().state_exists());
    }
}
