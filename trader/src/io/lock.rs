//! Account-scoped advisory file lock.
//!
//! One lock file per account directory. Holding an [`AccountLock`] is the only
//! way to write that account's ledger; the lock is released when the guard is
//! dropped, on every exit path including unwinding.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::io::ledger::LedgerError;

const TRY_LOCK_INTERVAL: Duration = Duration::from_millis(10);

/// Exclusive hold on one account's lock file.
#[derive(Debug)]
pub struct AccountLock {
    file: File,
    path: PathBuf,
}

impl AccountLock {
    /// Block until the lock is held.
    pub fn acquire(path: &Path) -> Result<Self, LedgerError> {
        let file = open_lock_file(path)?;
        file.lock_exclusive()
            .map_err(|source| LedgerError::storage(path, source))?;
        debug!(path = %path.display(), "account lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Like [`AccountLock::acquire`], but give up after `timeout`.
    pub fn acquire_timeout(path: &Path, timeout: Duration) -> Result<Self, LedgerError> {
        let file = open_lock_file(path)?;
        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(path = %path.display(), "account lock acquired");
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                    if Instant::now() >= deadline {
                        warn!(path = %path.display(), timeout_ms = timeout.as_millis() as u64, "account lock timed out");
                        return Err(LedgerError::LockTimeout {
                            path: path.to_path_buf(),
                            timeout,
                        });
                    }
                    thread::sleep(TRY_LOCK_INTERVAL);
                }
                Err(source) => return Err(LedgerError::storage(path, source)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AccountLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), err = %err, "failed to release account lock");
        } else {
            debug!(path = %self.path.display(), "account lock released");
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File, LedgerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| LedgerError::storage(parent, source))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LedgerError::storage(path, source))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_times_out_until_first_releases() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("acct").join(".position.lock");

        let first = AccountLock::acquire(&path).expect("first lock");
        let err = AccountLock::acquire_timeout(&path, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, LedgerError::LockTimeout { .. }));

        drop(first);
        AccountLock::acquire_timeout(&path, Duration::from_millis(500)).expect("lock after release");
    }

    #[test]
    fn locks_for_different_accounts_are_independent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let a = AccountLock::acquire(&temp.path().join("a/.position.lock")).expect("lock a");
        let b = AccountLock::acquire_timeout(
            &temp.path().join("b/.position.lock"),
            Duration::from_millis(50),
        )
        .expect("lock b while a is held");
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn uncreatable_directory_is_storage_unavailable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("not-a-dir");
        fs::write(&blocker, "file").expect("write blocker");

        let err = AccountLock::acquire(&blocker.join("acct/.position.lock")).unwrap_err();
        assert!(matches!(err, LedgerError::StorageUnavailable { .. }));
    }
}
