//! State Store
//!
//! Owns the upgrade state file in a deployment home directory:
//! 1. Checksummed JSON (SHA-256 over the state with `checksum` cleared)
//! 2. Atomic saves (temp file in the same directory, fsync, rename)
//! 3. Validation of every persisted invariant on load and save
//! 4. A sibling lock file for cross-process exclusion
//!
//! Nothing here retries. A failed save or a corrupted load is reported as-is.

use crate::error::{Result, UpgradeError};
use crate::lock::FileLock;
use crate::state::{Stage, UpgradeState};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn, Span};

/// State file name inside the home directory
pub const STATE_FILE_NAME: &str = "upgrade-state.json";

/// Lock file name inside the home directory
pub const LOCK_FILE_NAME: &str = "upgrade-state.lock";

/// Per-save suffix so concurrent saves in one process never share a temp file
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

// ============================================================================
// Checksum
// ============================================================================

/// SHA-256 hex digest of `state` with its checksum field cleared
pub fn compute_checksum(state: &UpgradeState) -> Result<String> {
    let mut unsigned = state.clone();
    unsigned.checksum.clear();
    let bytes = serde_json::to_vec(&unsigned)
        .map_err(|e| UpgradeError::InvalidInput(format!("cannot serialize state: {}", e)))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

// ============================================================================
// Store
// ============================================================================

/// Load/save/lock a single `UpgradeState` on disk
#[derive(Debug, Clone)]
pub struct StateStore {
    home: PathBuf,
    span: Span,
}

impl StateStore {
    pub fn new(home: impl Into<PathBuf>, span: Span) -> Self {
        Self {
            home: home.into(),
            span,
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn state_path(&self) -> PathBuf {
        self.home.join(STATE_FILE_NAME)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.home.join(LOCK_FILE_NAME)
    }

    /// `Ok(None)` when no upgrade state exists
    pub fn load_state(&self) -> Result<Option<UpgradeState>> {
        let _enter = self.span.enter();
        let path = self.state_path();

        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no upgrade state file");
                return Ok(None);
            }
            Err(e) => {
                return Err(UpgradeError::corruption(
                    &path,
                    format!("unreadable state file: {}", e),
                ))
            }
        };

        let state: UpgradeState = serde_json::from_slice(&data)
            .map_err(|e| UpgradeError::corruption(&path, format!("invalid JSON: {}", e)))?;

        if state.checksum.is_empty() {
            // Files written before checksums existed
            debug!(path = %path.display(), "state has no checksum, skipping verification");
        } else {
            let expected = compute_checksum(&state)?;
            if expected != state.checksum {
                warn!(
                    path = %path.display(),
                    stored = %state.checksum,
                    computed = %expected,
                    "upgrade state checksum mismatch"
                );
                return Err(UpgradeError::corruption(
                    &path,
                    format!(
                        "checksum mismatch (stored {}, computed {})",
                        state.checksum, expected
                    ),
                ));
            }
        }

        self.validate_state(&state)?;
        debug!(upgrade = %state.upgrade_name, stage = %state.stage, "loaded upgrade state");
        Ok(Some(state))
    }

    /// Validate, checksum and atomically write `state`. Sets `state.checksum`.
    ///
    /// Each call writes its own temp file, so unlocked concurrent saves are
    /// last-writer-wins and never interleave bytes.
    pub fn save_state(&self, state: &mut UpgradeState) -> Result<()> {
        let _enter = self.span.enter();
        self.validate_state(state)?;

        state.checksum = compute_checksum(state)?;
        let json = serde_json::to_vec_pretty(&*state)
            .map_err(|e| UpgradeError::InvalidInput(format!("cannot serialize state: {}", e)))?;

        fs::create_dir_all(&self.home)?;
        let path = self.state_path();
        let temp_path = self.home.join(format!(
            ".{}.{}.{}.tmp",
            STATE_FILE_NAME,
            std::process::id(),
            TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));

        if let Err(e) = write_and_sync(&temp_path, &json).and_then(|_| fs::rename(&temp_path, &path)) {
            let _ = fs::remove_file(&temp_path);
            warn!(path = %path.display(), error = %e, "failed to save upgrade state");
            return Err(e.into());
        }
        sync_dir(&self.home);

        debug!(
            upgrade = %state.upgrade_name,
            stage = %state.stage,
            bytes = json.len(),
            "saved upgrade state"
        );
        Ok(())
    }

    /// Idempotent
    pub fn delete_state(&self) -> Result<()> {
        let _enter = self.span.enter();
        let path = self.state_path();
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "deleted upgrade state");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn state_exists(&self) -> bool {
        self.state_path().is_file()
    }

    /// Check every persisted invariant, reporting the first violation
    pub fn validate_state(&self, state: &UpgradeState) -> Result<()> {
        let fail = |reason: String| Err(UpgradeError::corruption(self.state_path(), reason));

        if state.schema_version < 1 {
            return fail(format!("invalid schema version {}", state.schema_version));
        }
        if state.upgrade_name.trim().is_empty() {
            return fail("upgrade name is empty".to_string());
        }
        let Some(first) = state.stage_history.first() else {
            return fail("stage history is empty".to_string());
        };
        if let Some(from) = first.from {
            return fail(format!(
                "first history entry must have an empty source stage, found '{}'",
                from
            ));
        }
        if state.created_at > state.updated_at {
            return fail(format!(
                "created_at {} is after updated_at {}",
                state.created_at, state.updated_at
            ));
        }
        if !state.error.is_empty() && state.stage != Stage::Failed {
            return fail(format!("error is set but stage is '{}'", state.stage));
        }
        for (i, vote) in state.validator_votes.iter().enumerate() {
            if vote.voted && vote.tx_hash.is_empty() {
                return fail(format!(
                    "validator_votes[{}] ({}) is marked voted without a tx hash",
                    i, vote.address
                ));
            }
        }
        for (i, switch) in state.node_switches.iter().enumerate() {
            if switch.switched && !(switch.stopped && switch.started) {
                return fail(format!(
                    "node_switches[{}] ({}) is switched but not stopped and started",
                    i, switch.node_name
                ));
            }
            if switch.switched && switch.new_binary.is_empty() {
                return fail(format!(
                    "node_switches[{}] ({}) is switched without a new binary",
                    i, switch.node_name
                ));
            }
        }
        Ok(())
    }

    /// Non-blocking exclusive lock for the mutating critical section.
    ///
    /// When another process holds it and a state file exists, the error names
    /// the upgrade and stage that process is working on.
    pub fn acquire_lock(&self) -> Result<StateLock> {
        let _enter = self.span.enter();
        let lock_path = self.lock_path();

        if let Some(lock) = FileLock::try_acquire(&lock_path)? {
            debug!(path = %lock_path.display(), "acquired upgrade lock");
            return Ok(StateLock {
                lock: Some(lock),
                span: self.span.clone(),
            });
        }

        match self.load_state() {
            Ok(Some(state)) => {
                warn!(
                    upgrade = %state.upgrade_name,
                    stage = %state.stage,
                    "upgrade lock is held by another process"
                );
                Err(UpgradeError::UpgradeInProgress {
                    upgrade_name: state.upgrade_name,
                    stage: state.stage,
                    lock_path,
                })
            }
            _ => Err(UpgradeError::LockContended { path: lock_path }),
        }
    }
}

/// Held upgrade lock. Released by `release` or on drop.
#[derive(Debug)]
pub struct StateLock {
    lock: Option<FileLock>,
    span: Span,
}

impl StateLock {
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        let Some(lock) = self.lock.take() else {
            return Ok(());
        };
        let _enter = self.span.enter();
        let path = lock.path().to_path_buf();
        lock.release()?;
        debug!(path = %path.display(), "released upgrade lock");
        Ok(())
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            let _enter = self.span.enter();
            warn!(error = %e, "failed to release upgrade lock");
        }
    }
}

fn write_and_sync(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

/// Persist the rename itself; best-effort
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(d) = fs::File::open(dir) {
            let _ = d.sync_all();
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}
