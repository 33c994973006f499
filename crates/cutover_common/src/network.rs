//! Network State Interface
//!
//! The narrow view of a running chain that detection needs. Production code
//! uses `RpcNetworkState` (see `rpc`); tests use `FakeNetworkState` with
//! scripted answers and no network access.

use crate::error::{Result, UpgradeError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

// ============================================================================
// Types
// ============================================================================

/// Governance proposal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    /// Deposit period, not yet voting
    Pending,
    Voting,
    Passed,
    Rejected,
    Failed,
    Unknown,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Voting => "voting",
            ProposalStatus::Passed => "passed",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Failed => "failed",
            ProposalStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: u64,
    pub status: ProposalStatus,
    #[serde(default)]
    pub title: String,
    pub voting_end_time: Option<DateTime<Utc>>,
}

/// A vote as reported by the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalVote {
    pub voter: String,
    /// yes / no / abstain / no_with_veto
    pub option: String,
}

/// Scheduled software upgrade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradePlan {
    pub name: String,
    pub height: i64,
    #[serde(default)]
    pub info: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovParams {
    pub voting_period_secs: u64,
    #[serde(default)]
    pub quorum: String,
    #[serde(default)]
    pub threshold: String,
}

// ============================================================================
// Trait
// ============================================================================

/// Read-only queries against a running chain
#[async_trait]
pub trait NetworkState: Send + Sync {
    async fn get_block_height(&self) -> Result<i64>;

    async fn get_block_time(&self) -> Result<DateTime<Utc>>;

    /// False when the node cannot be reached at all
    async fn is_chain_running(&self) -> bool;

    /// Resolve once the chain reaches `height`
    async fn wait_for_block(&self, height: i64) -> Result<()>;

    async fn get_proposal(&self, id: u64) -> Result<Proposal>;

    async fn get_proposal_votes(&self, id: u64) -> Result<Vec<ProposalVote>>;

    /// `None` when no upgrade is scheduled
    async fn get_upgrade_plan(&self) -> Result<Option<UpgradePlan>>;

    async fn get_app_version(&self) -> Result<String>;

    async fn get_gov_params(&self) -> Result<GovParams>;
}

// ============================================================================
// Fake Network State (Testing)
// ============================================================================

/// Scripted network state for tests
#[derive(Debug, Default)]
pub struct FakeNetworkState {
    running: bool,
    /// Successive height answers; the last one repeats
    heights: Mutex<VecDeque<i64>>,
    proposals: HashMap<u64, Proposal>,
    votes: HashMap<u64, Vec<ProposalVote>>,
    plan: Option<UpgradePlan>,
    /// Every query except `is_chain_running` fails
    unreachable: bool,
    proposal_calls: AtomicUsize,
}

impl FakeNetworkState {
    /// A running chain at height 1 with no proposals
    pub fn running() -> Self {
        Self {
            running: true,
            heights: Mutex::new(VecDeque::from([1])),
            ..Default::default()
        }
    }

    /// A node that cannot be reached
    pub fn unreachable() -> Self {
        Self {
            running: false,
            unreachable: true,
            ..Default::default()
        }
    }

    pub fn with_heights(self, heights: &[i64]) -> Self {
        *self.heights.lock().unwrap_or_else(|e| e.into_inner()) = heights.iter().copied().collect();
        self
    }

    pub fn with_proposal(mut self, id: u64, status: ProposalStatus) -> Self {
        self.proposals.insert(
            id,
            Proposal {
                id,
                status,
                title: format!("proposal {}", id),
                voting_end_time: None,
            },
        );
        self
    }

    pub fn with_votes(mut self, id: u64, votes: Vec<ProposalVote>) -> Self {
        self.votes.insert(id, votes);
        self
    }

    pub fn with_plan(mut self, plan: UpgradePlan) -> Self {
        self.plan = Some(plan);
        self
    }

    /// How many proposal lookups were made
    pub fn proposal_calls(&self) -> usize {
        self.proposal_calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable {
            return Err(UpgradeError::Network("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkState for FakeNetworkState {
    async fn get_block_height(&self) -> Result<i64> {
        self.check_reachable()?;
        let mut heights = self.heights.lock().unwrap_or_else(|e| e.into_inner());
        let height = match heights.len() {
            0 => 0,
            1 => heights[0],
            _ => heights.pop_front().unwrap_or_default(),
        };
        Ok(height)
    }

    async fn get_block_time(&self) -> Result<DateTime<Utc>> {
        self.check_reachable()?;
        Ok(Utc::now())
    }

    async fn is_chain_running(&self) -> bool {
        self.running
    }

    async fn wait_for_block(&self, height: i64) -> Result<()> {
        loop {
            if self.get_block_height().await? >= height {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
    }

    async fn get_proposal(&self, id: u64) -> Result<Proposal> {
        self.proposal_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        self.proposals
            .get(&id)
            .cloned()
            .ok_or_else(|| UpgradeError::Network(format!("proposal {} not found", id)))
    }

    async fn get_proposal_votes(&self, id: u64) -> Result<Vec<ProposalVote>> {
        self.check_reachable()?;
        Ok(self.votes.get(&id).cloned().unwrap_or_default())
    }

    async fn get_upgrade_plan(&self) -> Result<Option<UpgradePlan>> {
        self.check_reachable()?;
        Ok(self.plan.clone())
    }

    async fn get_app_version(&self) -> Result<String> {
        self.check_reachable()?;
        Ok("v1.0.0".to_string())
    }

    async fn get_gov_params(&self) -> Result<GovParams> {
        self.check_reachable()?;
        Ok(GovParams {
            voting_period_secs: 60,
            quorum: "0.334".to_string(),
            threshold: "0.5".to_string(),
        })
    }
}
