//! State Detector
//!
//! Maps live chain observations onto a stage. Detection is best-effort: when
//! the chain cannot be queried, the persisted stage is reported instead.
//! Every method is async and stops promptly when its future is dropped.

use crate::error::{Result, UpgradeError};
use crate::network::{NetworkState, ProposalStatus, ProposalVote};
use crate::state::{Stage, UpgradeState};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn, Instrument, Span};

/// Default window between the two height samples of `detect_chain_status`
pub const DEFAULT_HALT_SAMPLE: Duration = Duration::from_secs(3);

/// Liveness of the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainStatus {
    Running,
    Halted,
    Unreachable,
}

impl ChainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainStatus::Running => "running",
            ChainStatus::Halted => "halted",
            ChainStatus::Unreachable => "unreachable",
        }
    }
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub halt_sample: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            halt_sample: DEFAULT_HALT_SAMPLE,
        }
    }
}

pub struct StateDetector {
    network: Arc<dyn NetworkState>,
    config: DetectorConfig,
    span: Span,
}

impl StateDetector {
    pub fn new(network: Arc<dyn NetworkState>, config: DetectorConfig, span: Span) -> Self {
        Self {
            network,
            config,
            span,
        }
    }

    pub async fn detect_proposal_status(&self, id: u64) -> Result<ProposalStatus> {
        if id == 0 {
            return Err(UpgradeError::InvalidInput(
                "no proposal id to look up".to_string(),
            ));
        }
        let proposal = self
            .network
            .get_proposal(id)
            .instrument(self.span.clone())
            .await?;
        Ok(proposal.status)
    }

    /// Samples the height twice, `halt_sample` apart
    pub async fn detect_chain_status(&self) -> ChainStatus {
        async {
            if !self.network.is_chain_running().await {
                return ChainStatus::Unreachable;
            }
            let first = match self.network.get_block_height().await {
                Ok(h) => h,
                Err(e) => {
                    debug!(error = %e, "height query failed");
                    return ChainStatus::Unreachable;
                }
            };
            tokio::time::sleep(self.config.halt_sample).await;
            let second = match self.network.get_block_height().await {
                Ok(h) => h,
                Err(e) => {
                    debug!(error = %e, "height query failed");
                    return ChainStatus::Unreachable;
                }
            };

            let status = if second > first {
                ChainStatus::Running
            } else {
                ChainStatus::Halted
            };
            debug!(first, second, %status, "chain status sampled");
            status
        }
        .instrument(self.span.clone())
        .await
    }

    /// Stage implied by the chain, falling back to `state.stage`
    pub async fn detect_current_stage(&self, state: Option<&UpgradeState>) -> Result<Stage> {
        let Some(state) = state else {
            return Err(UpgradeError::InvalidInput(
                "no upgrade state to detect from".to_string(),
            ));
        };

        if state.proposal_id == 0 {
            let stage = if state.node_switches.is_empty() {
                Stage::Initialized
            } else {
                Stage::SwitchingBinary
            };
            return Ok(stage);
        }

        let status = match self.detect_proposal_status(state.proposal_id).await {
            Ok(status) => status,
            Err(e) => {
                let _enter = self.span.enter();
                warn!(
                    proposal = state.proposal_id,
                    error = %e,
                    fallback = %state.stage,
                    "proposal lookup failed, keeping saved stage"
                );
                return Ok(state.stage);
            }
        };

        let stage = match status {
            ProposalStatus::Pending => Stage::ProposalSubmitted,
            ProposalStatus::Voting => Stage::Voting,
            ProposalStatus::Rejected => Stage::ProposalRejected,
            // Passing says nothing about the height or the binaries.
            ProposalStatus::Passed | ProposalStatus::Failed | ProposalStatus::Unknown => {
                state.stage
            }
        };

        let _enter = self.span.enter();
        debug!(proposal = state.proposal_id, %status, detected = %stage, "detected stage");
        Ok(stage)
    }

    pub async fn detect_validator_votes(&self, id: u64) -> Result<Vec<ProposalVote>> {
        if id == 0 {
            return Err(UpgradeError::InvalidInput(
                "no proposal id to look up votes for".to_string(),
            ));
        }
        self.network
            .get_proposal_votes(id)
            .instrument(self.span.clone())
            .await
    }
}
