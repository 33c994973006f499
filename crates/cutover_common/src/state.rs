//! Upgrade State
//!
//! The persisted record of one upgrade attempt. A single state file exists per
//! deployment home directory; everything except the store works on an
//! in-memory copy.
//!
//! Stage changes go through [`crate::transition::StateTransitioner`]. The
//! helpers here only touch the vote and node-switch bookkeeping.

use crate::error::{Result, UpgradeError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current persisted-format version
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Reason recorded on the seed history entry
pub const INITIAL_REASON: &str = "upgrade initiated";

// ============================================================================
// Stage
// ============================================================================

/// A named point in the upgrade transition graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initialized,
    ProposalSubmitted,
    Voting,
    WaitingForHeight,
    ChainHalted,
    SwitchingBinary,
    VerifyingResume,
    Completed,
    Failed,
    ProposalRejected,
}

impl Stage {
    pub const ALL: [Stage; 10] = [
        Stage::Initialized,
        Stage::ProposalSubmitted,
        Stage::Voting,
        Stage::WaitingForHeight,
        Stage::ChainHalted,
        Stage::SwitchingBinary,
        Stage::VerifyingResume,
        Stage::Completed,
        Stage::Failed,
        Stage::ProposalRejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Initialized => "initialized",
            Stage::ProposalSubmitted => "proposal_submitted",
            Stage::Voting => "voting",
            Stage::WaitingForHeight => "waiting_for_height",
            Stage::ChainHalted => "chain_halted",
            Stage::SwitchingBinary => "switching_binary",
            Stage::VerifyingResume => "verifying_resume",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
            Stage::ProposalRejected => "proposal_rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Stage::ALL.iter().copied().find(|stage| stage.as_str() == s)
    }

    /// Completed, Failed and ProposalRejected have no outgoing edges
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Stage::Completed | Stage::Failed | Stage::ProposalRejected
        )
    }

    /// Stages that only exist on the governance path
    pub fn is_governance_only(&self) -> bool {
        matches!(
            self,
            Stage::ProposalSubmitted
                | Stage::Voting
                | Stage::WaitingForHeight
                | Stage::ChainHalted
                | Stage::ProposalRejected
        )
    }

    /// Short operator-facing description
    pub fn description(&self) -> &'static str {
        match self {
            Stage::Initialized => "upgrade created, nothing submitted yet",
            Stage::ProposalSubmitted => "governance proposal submitted",
            Stage::Voting => "validators are voting",
            Stage::WaitingForHeight => "proposal passed, waiting for upgrade height",
            Stage::ChainHalted => "chain halted at upgrade height",
            Stage::SwitchingBinary => "switching node binaries",
            Stage::VerifyingResume => "verifying the chain resumed",
            Stage::Completed => "upgrade completed",
            Stage::Failed => "upgrade failed",
            Stage::ProposalRejected => "proposal rejected by governance",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = UpgradeError;

    fn from_str(s: &str) -> Result<Self> {
        Stage::parse(s).ok_or_else(|| UpgradeError::InvalidInput(format!("unknown stage '{}'", s)))
    }
}

/// The seed history entry has no source stage; it is written as `""`.
mod optional_stage {
    use super::Stage;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(stage: &Option<Stage>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(stage.map(|s| s.as_str()).unwrap_or(""))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Stage>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Ok(None);
        }
        Stage::parse(&raw)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("unknown stage '{}'", raw)))
    }
}

// ============================================================================
// Mode
// ============================================================================

/// How the network's nodes are run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Docker,
    Local,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Docker => "docker",
            Mode::Local => "local",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "docker" => Some(Mode::Docker),
            "local" => Some(Mode::Local),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = UpgradeError;

    fn from_str(s: &str) -> Result<Self> {
        Mode::parse(s).ok_or_else(|| {
            UpgradeError::InvalidInput(format!("mode must be 'docker' or 'local', got '{}'", s))
        })
    }
}

// ============================================================================
// Records
// ============================================================================

/// One validator's vote on the upgrade proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorVote {
    pub address: String,
    #[serde(default)]
    pub moniker: String,
    pub voted: bool,
    /// Required when `voted` is true
    #[serde(default)]
    pub tx_hash: String,
    pub timestamp: DateTime<Utc>,
}

/// Binary switch progress for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSwitch {
    pub node_name: String,
    pub switched: bool,
    pub stopped: bool,
    pub started: bool,
    #[serde(default)]
    pub old_binary: String,
    #[serde(default)]
    pub new_binary: String,
    pub timestamp: DateTime<Utc>,
}

impl NodeSwitch {
    pub fn new(node_name: &str, old_binary: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            switched: false,
            stopped: false,
            started: false,
            old_binary: old_binary.to_string(),
            new_binary: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn mark_stopped(&mut self) {
        self.stopped = true;
        self.timestamp = Utc::now();
    }

    pub fn mark_started(&mut self) {
        self.started = true;
        self.timestamp = Utc::now();
    }

    /// A switched node has been stopped, restarted and runs `new_binary`
    pub fn mark_switched(&mut self, new_binary: &str) {
        self.stopped = true;
        self.started = true;
        self.switched = true;
        self.new_binary = new_binary.to_string();
        self.timestamp = Utc::now();
    }
}

/// One append-only history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTransition {
    #[serde(with = "optional_stage")]
    pub from: Option<Stage>,
    pub to: Stage,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

// ============================================================================
// Upgrade State
// ============================================================================

/// One active or terminal upgrade attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeState {
    pub schema_version: u32,

    // Fixed at creation
    pub upgrade_name: String,
    pub mode: Mode,
    pub skip_governance: bool,

    pub stage: Stage,

    /// 0 means no proposal has been submitted
    #[serde(default)]
    pub proposal_id: u64,
    #[serde(default)]
    pub upgrade_height: i64,
    #[serde(default)]
    pub target_binary: String,
    #[serde(default)]
    pub target_version: String,
    #[serde(default)]
    pub target_image: String,

    #[serde(default)]
    pub validator_votes: Vec<ValidatorVote>,
    #[serde(default)]
    pub node_switches: Vec<NodeSwitch>,
    pub stage_history: Vec<StageTransition>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Only set when `stage` is Failed
    #[serde(default)]
    pub error: String,

    /// SHA-256 of the state serialized with this field cleared
    #[serde(default)]
    pub checksum: String,
}

impl UpgradeState {
    /// Fresh state at Initialized with the seed history entry
    pub fn new(upgrade_name: &str, mode: Mode, skip_governance: bool) -> Self {
        let now = Utc::now();
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            upgrade_name: upgrade_name.to_string(),
            mode,
            skip_governance,
            stage: Stage::Initialized,
            proposal_id: 0,
            upgrade_height: 0,
            target_binary: String::new(),
            target_version: String::new(),
            target_image: String::new(),
            validator_votes: Vec::new(),
            node_switches: Vec::new(),
            stage_history: vec![StageTransition {
                from: None,
                to: Stage::Initialized,
                timestamp: now,
                reason: INITIAL_REASON.to_string(),
            }],
            created_at: now,
            updated_at: now,
            error: String::new(),
            checksum: String::new(),
        }
    }

    pub fn with_target(mut self, binary: &str, version: &str, image: &str) -> Self {
        self.target_binary = binary.to_string();
        self.target_version = version.to_string();
        self.target_image = image.to_string();
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn last_transition(&self) -> Option<&StageTransition> {
        self.stage_history.last()
    }

    /// Next timestamp for this state, strictly after `updated_at`.
    pub(crate) fn advance_clock(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if now <= self.updated_at {
            now = self.updated_at + Duration::microseconds(1);
        }
        self.updated_at = now;
        now
    }

    /// Record (or overwrite) a cast vote for `address`
    pub fn record_vote(&mut self, address: &str, moniker: &str, tx_hash: &str) -> Result<()> {
        if tx_hash.is_empty() {
            return Err(UpgradeError::InvalidInput(format!(
                "vote from {} has no transaction hash",
                address
            )));
        }
        let now = self.advance_clock();
        let vote = ValidatorVote {
            address: address.to_string(),
            moniker: moniker.to_string(),
            voted: true,
            tx_hash: tx_hash.to_string(),
            timestamp: now,
        };
        match self
            .validator_votes
            .iter_mut()
            .find(|v| v.address == address)
        {
            Some(existing) => *existing = vote,
            None => self.validator_votes.push(vote),
        }
        Ok(())
    }

    /// Record (or overwrite) switch progress for a node
    pub fn record_switch(&mut self, switch: NodeSwitch) {
        self.advance_clock();
        match self
            .node_switches
            .iter_mut()
            .find(|s| s.node_name == switch.node_name)
        {
            Some(existing) => *existing = switch,
            None => self.node_switches.push(switch),
        }
    }

    /// (votes cast, validators tracked)
    pub fn vote_tally(&self) -> (usize, usize) {
        let voted = self.validator_votes.iter().filter(|v| v.voted).count();
        (voted, self.validator_votes.len())
    }

    pub fn switched_nodes(&self) -> Vec<&str> {
        self.node_switches
            .iter()
            .filter(|s| s.switched)
            .map(|s| s.node_name.as_str())
            .collect()
    }

    pub fn pending_switches(&self) -> Vec<&str> {
        self.node_switches
            .iter()
            .filter(|s| !s.switched)
            .map(|s| s.node_name.as_str())
            .collect()
    }

    /// Human-readable status block
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("Upgrade:     {}", self.upgrade_name),
            format!(
                "Stage:       {} ({})",
                self.stage,
                self.stage.description()
            ),
            format!(
                "Mode:        {}{}",
                self.mode,
                if self.skip_governance {
                    ", governance skipped"
                } else {
                    ""
                }
            ),
        ];

        if !self.target_version.is_empty() {
            lines.push(format!("Target:      {}", self.target_version));
        }
        if self.proposal_id != 0 {
            lines.push(format!("Proposal:    #{}", self.proposal_id));
        }
        if self.upgrade_height > 0 {
            lines.push(format!("Height:      {}", self.upgrade_height));
        }
        if !self.validator_votes.is_empty() {
            let (voted, total) = self.vote_tally();
            lines.push(format!("Votes:       {}/{}", voted, total));
        }
        if !self.node_switches.is_empty() {
            lines.push(format!(
                "Switched:    {}/{} nodes",
                self.switched_nodes().len(),
                self.node_switches.len()
            ));
        }
        if !self.error.is_empty() {
            lines.push(format!("Error:       {}", self.error));
        }
        lines.push(format!(
            "Updated:     {}",
            self.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        lines
    }
}
