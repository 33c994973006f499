//! Cutover Common - resumable upgrade bookkeeping for validator networks
//!
//! Knows, after any crash or restart, which upgrade stage to resume from:
//! - `transition`: the stage graph and its guards
//! - `store` / `lock`: checksummed, atomically written, locked state file
//! - `detector`: maps live chain observations onto a stage
//! - `resume`: the operator-facing resume / status / clear facade

pub mod config;
pub mod detector;
pub mod error;
pub mod lock;
pub mod network;
pub mod resume;
pub mod rpc;
pub mod state;
pub mod store;
pub mod transition;

pub use config::CutoverConfig;
pub use detector::{ChainStatus, DetectorConfig, StateDetector};
pub use error::{Result, UpgradeError};
pub use network::{FakeNetworkState, NetworkState, ProposalStatus, ProposalVote};
pub use resume::{ResumeFacade, ResumeInput, ResumeOptions, ResumeResult, UpgradeExecutor};
pub use rpc::RpcNetworkState;
pub use state::{Mode, NodeSwitch, Stage, StageTransition, UpgradeState, ValidatorVote};
pub use store::{StateLock, StateStore};
pub use transition::StateTransitioner;
