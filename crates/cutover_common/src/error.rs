//! Error types for cutover.
//!
//! One closed set of failure kinds. Callers match on the variant instead of
//! probing for concrete error types.

use crate::state::Stage;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpgradeError {
    /// Invalid JSON, checksum mismatch or a broken invariant. Never auto-repaired.
    #[error("upgrade state at {} is corrupted: {reason}", .path.display())]
    StateCorruption { path: PathBuf, reason: String },

    /// A caller asked for a stage jump the graph does not allow.
    #[error("invalid stage transition: {from} -> {to}")]
    InvalidTransition { from: Stage, to: Stage },

    /// Another process holds the lock on an existing upgrade.
    ///
    /// clear-state and force-restart need the same lock. Where the lock is an
    /// exclusively created file (non-Unix), a crashed holder leaves it behind
    /// and it has to be removed by hand.
    #[error("upgrade '{upgrade_name}' is already in progress (stage: {stage}); wait for it to finish, or delete {} if no cutover process is running", .lock_path.display())]
    UpgradeInProgress {
        upgrade_name: String,
        stage: Stage,
        lock_path: PathBuf,
    },

    /// Lock held but the persisted state could not be read.
    #[error("upgrade lock {} is held by another process; delete it if no cutover process is running", .path.display())]
    LockContended { path: PathBuf },

    #[error("saved upgrade '{found}' does not match requested upgrade '{expected}'")]
    StateMismatch { expected: String, found: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("network query failed: {0}")]
    Network(String),

    #[error("upgrade execution failed: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl UpgradeError {
    pub(crate) fn corruption(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        UpgradeError::StateCorruption {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, UpgradeError::StateCorruption { .. })
    }

    /// True for the lock-contention kinds; the caller should abort, not retry.
    pub fn is_lock_conflict(&self) -> bool {
        matches!(
            self,
            UpgradeError::UpgradeInProgress { .. } | UpgradeError::LockContended { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, UpgradeError>;
