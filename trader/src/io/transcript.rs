//! Per-session transcript (`log/<session_id>/log.jsonl`).
//!
//! Transcripts are observational: one NDJSON line per batch of messages, each
//! tagged with the account and a writer-local timestamp. They never feed back
//! into control flow.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, FixedOffset, Local};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::conversation::Message;
use crate::core::types::{Account, AccountContext};

const TRANSCRIPT_FILE: &str = "log.jsonl";
const MAX_SESSION_SUFFIX: u32 = 1000;

/// Destination for a session's conversation turns.
pub trait TranscriptSink {
    fn session_id(&self) -> &str;
    fn append(&mut self, messages: &[Message]) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub timestamp: DateTime<FixedOffset>,
    pub signature: String,
    #[serde(rename = "account_context", alias = "account")]
    pub account: AccountContext,
    pub messages: Vec<Message>,
}

/// File-backed transcript for one session run.
#[derive(Debug)]
pub struct TranscriptLog {
    session_id: String,
    path: PathBuf,
    signature: String,
    account: AccountContext,
}

impl TranscriptLog {
    /// Claim a fresh session directory under `log_dir` and return its transcript.
    ///
    /// The id is `<prefix><YYYYMMDD_HHMMSS>`; if another session already claimed
    /// that second, `-2`, `-3`, ... are tried until a directory can be created.
    pub fn create(log_dir: &Path, prefix: &str, account: &Account) -> Result<Self> {
        let base = format!("{prefix}{}", Local::now().format("%Y%m%d_%H%M%S"));
        fs::create_dir_all(log_dir)
            .with_context(|| format!("create transcript dir {}", log_dir.display()))?;
        let (session_id, dir) = claim_session_dir(log_dir, &base)?;
        debug!(session_id = %session_id, dir = %dir.display(), "transcript created");
        Ok(Self {
            session_id,
            path: dir.join(TRANSCRIPT_FILE),
            signature: account.signature.clone(),
            account: account.context(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TranscriptSink for TranscriptLog {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn append(&mut self, messages: &[Message]) -> Result<()> {
        let entry = TranscriptEntry {
            timestamp: Local::now().fixed_offset(),
            signature: self.signature.clone(),
            account: self.account.clone(),
            messages: messages.to_vec(),
        };
        let mut line = serde_json::to_string(&entry).context("serialize transcript entry")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open transcript {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append transcript {}", self.path.display()))?;
        Ok(())
    }
}

fn claim_session_dir(log_dir: &Path, base: &str) -> Result<(String, PathBuf)> {
    for n in 1..=MAX_SESSION_SUFFIX {
        let candidate = if n == 1 {
            base.to_string()
        } else {
            format!("{base}-{n}")
        };
        let dir = log_dir.join(&candidate);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok((candidate, dir)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(err).with_context(|| format!("create session dir {}", dir.display()));
            }
        }
    }
    Err(anyhow!(
        "no free session id for {base} under {}",
        log_dir.display()
    ))
}

/// Read a transcript back, skipping unparseable lines.
pub fn read_transcript(path: &Path) -> Result<Vec<TranscriptEntry>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read transcript {}", path.display()))?;
    Ok(contents
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}
