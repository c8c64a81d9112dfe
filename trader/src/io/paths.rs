//! Canonical on-disk layout for one account.
//!
//! ```text
//! <data_dir>/<signature>/
//! ├── .position.lock
//! ├── position/position.jsonl
//! └── log/<session_id>/log.jsonl
//! ```

use std::path::{Path, PathBuf};

/// All canonical paths for one account signature.
#[derive(Debug, Clone)]
pub struct AccountPaths {
    pub account_dir: PathBuf,
    pub lock_path: PathBuf,
    pub position_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub log_dir: PathBuf,
}

impl AccountPaths {
    pub fn new(data_dir: &Path, signature: &str) -> Self {
        let account_dir = data_dir.join(signature);
        let position_dir = account_dir.join("position");
        Self {
            lock_path: account_dir.join(".position.lock"),
            ledger_path: position_dir.join("position.jsonl"),
            log_dir: account_dir.join("log"),
            position_dir,
            account_dir,
        }
    }

    pub fn transcript_dir(&self, session_id: &str) -> PathBuf {
        self.log_dir.join(session_id)
    }
}
