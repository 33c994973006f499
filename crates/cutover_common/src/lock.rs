//! Cross-process exclusive lock on a dedicated lock file
//!
//! Advisory only: it excludes cooperating cutover processes, nothing else.
//! The lock file is empty and separate from the state file so the atomic
//! rename in `StateStore::save_state` never replaces a locked inode.
//!
//! - Unix: `flock(LOCK_EX | LOCK_NB)` on the lock file
//! - Elsewhere: exclusive creation of the lock file

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Attempts to open and lock before giving up on a lock file that keeps
/// being replaced underneath us
const MAX_LOCK_ATTEMPTS: usize = 3;

/// A held lock. Dropping it releases the lock and removes the file.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: Option<File>,
}

impl FileLock {
    /// Non-blocking acquire. `Ok(None)` means another holder has it.
    pub fn try_acquire(path: &Path) -> io::Result<Option<FileLock>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        for _ in 0..MAX_LOCK_ATTEMPTS {
            match platform::try_lock(path)? {
                platform::Attempt::Locked(file) => {
                    return Ok(Some(FileLock {
                        path: path.to_path_buf(),
                        file: Some(file),
                    }))
                }
                platform::Attempt::Busy => return Ok(None),
                platform::Attempt::Replaced => continue,
            }
        }
        Ok(None)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file, then drop the lock
    pub fn release(mut self) -> io::Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> io::Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        // Unlink while still holding the lock; waiters re-check the inode.
        let removed = match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        platform::unlock(&file);
        drop(file);
        removed
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.release_inner();
    }
}

#[cfg(unix)]
mod platform {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    pub enum Attempt {
        Locked(File),
        Busy,
        /// The path no longer names the inode we locked
        Replaced,
    }

    pub fn try_lock(path: &Path) -> io::Result<Attempt> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(Attempt::Busy);
            }
            return Err(err);
        }

        let held = file.metadata()?;
        match std::fs::metadata(path) {
            Ok(current) if current.ino() == held.ino() && current.dev() == held.dev() => {
                Ok(Attempt::Locked(file))
            }
            Ok(_) => Ok(Attempt::Replaced),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Attempt::Replaced),
            Err(e) => Err(e),
        }
    }

    pub fn unlock(file: &File) {
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(not(unix))]
mod platform {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::path::Path;

    pub enum Attempt {
        Locked(File),
        Busy,
        #[allow(dead_code)]
        Replaced,
    }

    pub fn try_lock(path: &Path) -> io::Result<Attempt> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => Ok(Attempt::Locked(file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(Attempt::Busy),
            Err(e) => Err(e),
        }
    }

    pub fn unlock(_file: &File) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_is_busy() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("upgrade-state.lock");

        let first = FileLock::try_acquire(&path).unwrap().expect("first lock");
        assert!(FileLock::try_acquire(&path).unwrap().is_none());

        first.release().unwrap();
        assert!(!path.exists());

        let second = FileLock::try_acquire(&path).unwrap();
        assert!(second.is_some());
    }

    #[test]
    fn test_drop_releases() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("upgrade-state.lock");
        {
            let _lock = FileLock::try_acquire(&path).unwrap().expect("lock");
            assert!(path.exists());
        }
        assert!(!path.exists());
        assert!(FileLock::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn test_lock_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("upgrade-state.lock");
        let lock = FileLock::try_acquire(&path).unwrap().expect("lock");
        assert_eq!(std::fs::metadata(lock.path()).unwrap().len(), 0);
    }
}
