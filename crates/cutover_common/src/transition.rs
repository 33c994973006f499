//! Stage transition graph
//!
//! ```text
//! governance:  initialized -> proposal_submitted -> voting -> waiting_for_height
//!              -> chain_halted -> switching_binary -> verifying_resume -> completed
//!                                 voting -> proposal_rejected
//! skip-gov:    initialized -> switching_binary -> verifying_resume -> completed
//!              (any non-terminal) -> failed
//! ```
//!
//! `can_transition` and `valid_transitions` answer for the static graph.
//! `transition_to` also applies the state's own path: a skip-governance
//! upgrade never enters a governance stage, and a governance upgrade never
//! takes the initialized -> switching_binary shortcut.

use crate::error::{Result, UpgradeError};
use crate::state::{Stage, StageTransition, UpgradeState};
use tracing::{debug, info, warn, Span};

/// Edges of the graph, excluding the implicit `-> Failed` edges
const EDGES: &[(Stage, Stage)] = &[
    (Stage::Initialized, Stage::ProposalSubmitted),
    (Stage::Initialized, Stage::SwitchingBinary),
    (Stage::ProposalSubmitted, Stage::Voting),
    (Stage::Voting, Stage::WaitingForHeight),
    (Stage::Voting, Stage::ProposalRejected),
    (Stage::WaitingForHeight, Stage::ChainHalted),
    (Stage::ChainHalted, Stage::SwitchingBinary),
    (Stage::SwitchingBinary, Stage::VerifyingResume),
    (Stage::VerifyingResume, Stage::Completed),
];

const GOV_PATH: &[Stage] = &[
    Stage::Initialized,
    Stage::ProposalSubmitted,
    Stage::Voting,
    Stage::WaitingForHeight,
    Stage::ChainHalted,
    Stage::SwitchingBinary,
    Stage::VerifyingResume,
    Stage::Completed,
];

const SKIP_GOV_PATH: &[Stage] = &[
    Stage::Initialized,
    Stage::SwitchingBinary,
    Stage::VerifyingResume,
    Stage::Completed,
];

/// Owns the transition rules and writes history entries
#[derive(Debug, Clone)]
pub struct StateTransitioner {
    span: Span,
}

impl StateTransitioner {
    pub fn new(span: Span) -> Self {
        Self { span }
    }

    /// Membership test against the static graph
    pub fn can_transition(&self, from: Stage, to: Stage) -> bool {
        if from.is_terminal() {
            return false;
        }
        if to == Stage::Failed {
            return true;
        }
        EDGES.iter().any(|&(f, t)| f == from && t == to)
    }

    /// `can_transition` plus the state's governance path
    pub fn can_transition_for(&self, state: &UpgradeState, to: Stage) -> bool {
        if !self.can_transition(state.stage, to) {
            return false;
        }
        if state.skip_governance {
            !to.is_governance_only()
        } else {
            !(state.stage == Stage::Initialized && to == Stage::SwitchingBinary)
        }
    }

    /// Move `state` to `to`, appending exactly one history entry.
    /// On error the state is left untouched.
    pub fn transition_to(&self, state: &mut UpgradeState, to: Stage, reason: &str) -> Result<()> {
        let _enter = self.span.enter();
        let from = state.stage;

        if !self.can_transition_for(state, to) {
            warn!(
                upgrade = %state.upgrade_name,
                %from,
                %to,
                skip_governance = state.skip_governance,
                "rejected stage transition"
            );
            return Err(UpgradeError::InvalidTransition { from, to });
        }

        let now = state.advance_clock();
        state.stage_history.push(StageTransition {
            from: Some(from),
            to,
            timestamp: now,
            reason: reason.to_string(),
        });
        state.stage = to;
        if to == Stage::Failed {
            state.error = reason.to_string();
        }

        info!(upgrade = %state.upgrade_name, %from, %to, reason, "stage transition");
        Ok(())
    }

    /// Outgoing edges of `from` in the static graph, path-agnostic
    pub fn valid_transitions(&self, from: Stage) -> Vec<Stage> {
        if from.is_terminal() {
            return Vec::new();
        }
        let mut next: Vec<Stage> = EDGES
            .iter()
            .filter(|&&(f, _)| f == from)
            .map(|&(_, t)| t)
            .collect();
        next.push(Stage::Failed);
        debug!(%from, count = next.len(), "valid transitions");
        next
    }

    pub fn next_stage_for_gov_path(&self, current: Stage) -> Option<Stage> {
        next_on_path(GOV_PATH, current)
    }

    pub fn next_stage_for_skip_gov_path(&self, current: Stage) -> Option<Stage> {
        next_on_path(SKIP_GOV_PATH, current)
    }

    /// Next stage along whichever path `state` follows
    pub fn next_stage_for(&self, state: &UpgradeState) -> Option<Stage> {
        if state.skip_governance {
            self.next_stage_for_skip_gov_path(state.stage)
        } else {
            self.next_stage_for_gov_path(state.stage)
        }
    }

    pub fn is_terminal(&self, stage: Stage) -> bool {
        stage.is_terminal()
    }
}

impl Default for StateTransitioner {
    fn default() -> Self {
        Self::new(Span::none())
    }
}

fn next_on_path(path: &[Stage], current: Stage) -> Option<Stage> {
    let idx = path.iter().position(|&s| s == current)?;
    path.get(idx + 1).copied()
}
