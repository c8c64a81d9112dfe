//! Append-only per-account position ledger (`position/position.jsonl`).
//!
//! Every line is one [`LedgerEntry`]. Entry `0` is the registration; each
//! accepted trade appends `max(sequence_id) + 1`, computed from the file itself
//! while holding the account lock, so a restarted process needs no other state.
//! Readers skip lines they cannot parse (e.g. a partial line left by a crash).
//!
//! Lines written by the earlier tooling (`id`, naive `date`, top-level
//! `market`/`trade_env`, `this_action`) are read as ordinary entries.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Deserializer, Serialize, de};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::markets::MarketId;
use crate::core::positions::{PositionSnapshot, TradeAction};
use crate::core::types::{Account, AccountContext, TradeEnv};
use crate::io::lock::AccountLock;
use crate::io::paths::AccountPaths;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("storage unavailable at {path}: {source}")]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("timed out after {timeout:?} waiting for lock {path}")]
    LockTimeout { path: PathBuf, timeout: Duration },
    #[error("account '{signature}' has no ledger (register it first)")]
    NotRegistered { signature: String },
    #[error("ledger {path} has records in an unrecognized format; not re-registering")]
    Unrecognized { path: PathBuf },
    #[error("serialize ledger entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl LedgerError {
    pub(crate) fn storage(path: &Path, source: io::Error) -> Self {
        Self::StorageUnavailable {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Naive local time format used by `date` in older ledgers.
const LEGACY_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One line of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredEntry")]
pub struct LedgerEntry {
    pub sequence_id: u64,
    /// Writer-local capture time. Advisory only; `sequence_id` orders entries.
    pub timestamp: DateTime<FixedOffset>,
    #[serde(rename = "account_context", skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<TradeAction>,
    pub positions: PositionSnapshot,
}

/// Every line shape the ledger has been written in.
#[derive(Deserialize)]
struct StoredEntry {
    #[serde(alias = "id")]
    sequence_id: u64,
    #[serde(alias = "date", deserialize_with = "deserialize_timestamp")]
    timestamp: DateTime<FixedOffset>,
    #[serde(default, alias = "account")]
    account_context: Option<AccountContext>,
    #[serde(default)]
    market: Option<MarketId>,
    #[serde(default)]
    trade_env: Option<TradeEnv>,
    #[serde(default, alias = "this_action")]
    action: Option<TradeAction>,
    positions: PositionSnapshot,
}

impl From<StoredEntry> for LedgerEntry {
    fn from(stored: StoredEntry) -> Self {
        let account = stored.account_context.or_else(|| {
            stored.market.map(|market| AccountContext {
                market,
                trade_env: stored.trade_env.unwrap_or_default(),
            })
        });
        Self {
            sequence_id: stored.sequence_id,
            timestamp: stored.timestamp,
            account,
            action: stored.action,
            positions: stored.positions,
        }
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<FixedOffset>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| de::Error::custom(format!("unrecognized timestamp '{raw}'")))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Some(timestamp);
    }
    let naive = NaiveDateTime::parse_from_str(raw, LEGACY_DATE_FORMAT).ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|timestamp| timestamp.fixed_offset())
}

/// Result of [`LedgerStore::register`].
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// A new ledger was started with this entry.
    Created(LedgerEntry),
    /// The ledger already existed; its first entry is left untouched.
    Existing(LedgerEntry),
}

impl Registration {
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            Registration::Created(entry) | Registration::Existing(entry) => entry,
        }
    }
}

/// Latest state of a ledger, for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSummary {
    pub signature: String,
    pub latest: LedgerEntry,
    pub total_records: usize,
}

/// Root of all account ledgers.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    data_dir: PathBuf,
    lock_timeout: Option<Duration>,
}

impl LedgerStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            lock_timeout: None,
        }
    }

    /// Bound lock waits instead of blocking indefinitely.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn paths(&self, signature: &str) -> AccountPaths {
        AccountPaths::new(&self.data_dir, signature)
    }

    /// Take the account's exclusive lock. Everything done through the returned
    /// writer (and anything else the caller does before dropping it) is
    /// serialized against other writers of the same account.
    pub fn lock(&self, signature: &str) -> Result<LedgerWriter, LedgerError> {
        let paths = self.paths(signature);
        let lock = match self.lock_timeout {
            Some(timeout) => AccountLock::acquire_timeout(&paths.lock_path, timeout)?,
            None => AccountLock::acquire(&paths.lock_path)?,
        };
        Ok(LedgerWriter {
            signature: signature.to_string(),
            ledger_path: paths.ledger_path,
            _lock: lock,
        })
    }

    /// Start the account's ledger with `initial` as entry `0`.
    ///
    /// An existing ledger is never overwritten: its first entry is reported back instead.
    pub fn register(
        &self,
        account: &Account,
        initial: PositionSnapshot,
    ) -> Result<Registration, LedgerError> {
        let writer = self.lock(&account.signature)?;
        writer.register(account, initial)
    }

    /// Append one trade under the account lock and return its sequence id.
    pub fn append(
        &self,
        signature: &str,
        action: TradeAction,
        positions: PositionSnapshot,
    ) -> Result<u64, LedgerError> {
        let writer = self.lock(signature)?;
        writer.append(action, positions)
    }

    /// All parseable entries in file order.
    pub fn read_all(&self, signature: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        read_entries(&self.paths(signature).ledger_path)
    }

    pub fn latest(&self, signature: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(self.read_all(signature)?.into_iter().last())
    }

    pub fn summary(&self, signature: &str) -> Result<PositionSummary, LedgerError> {
        let entries = self.read_all(signature)?;
        let total_records = entries.len();
        let latest = entries
            .into_iter()
            .last()
            .ok_or_else(|| LedgerError::NotRegistered {
                signature: signature.to_string(),
            })?;
        Ok(PositionSummary {
            signature: signature.to_string(),
            latest,
            total_records,
        })
    }
}

/// Write access to one account's ledger while its lock is held.
#[derive(Debug)]
pub struct LedgerWriter {
    signature: String,
    ledger_path: PathBuf,
    _lock: AccountLock,
}

impl LedgerWriter {
    pub fn read_all(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        read_entries(&self.ledger_path)
    }

    pub fn latest(&self) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(self.read_all()?.into_iter().last())
    }

    pub fn register(
        &self,
        account: &Account,
        initial: PositionSnapshot,
    ) -> Result<Registration, LedgerError> {
        if let Some(first) = self.read_all()?.into_iter().next() {
            warn!(
                signature = %self.signature,
                path = %self.ledger_path.display(),
                "ledger already exists; keeping existing history"
            );
            return Ok(Registration::Existing(first));
        }
        if has_complete_lines(&self.ledger_path)? {
            return Err(LedgerError::Unrecognized {
                path: self.ledger_path.clone(),
            });
        }
        let entry = LedgerEntry {
            sequence_id: 0,
            timestamp: Local::now().fixed_offset(),
            account: Some(account.context()),
            action: None,
            positions: initial,
        };
        self.write_line(&entry)?;
        info!(
            signature = %self.signature,
            market = %account.market,
            trade_env = %account.trade_env,
            cash = %entry.positions.cash,
            instruments = entry.positions.holdings.len(),
            "account registered"
        );
        Ok(Registration::Created(entry))
    }

    pub fn append(&self, action: TradeAction, positions: PositionSnapshot) -> Result<u64, LedgerError> {
        let entries = self.read_all()?;
        let max_id = entries
            .iter()
            .map(|entry| entry.sequence_id)
            .max()
            .ok_or_else(|| LedgerError::NotRegistered {
                signature: self.signature.clone(),
            })?;
        let entry = LedgerEntry {
            sequence_id: max_id + 1,
            timestamp: Local::now().fixed_offset(),
            account: None,
            action: Some(action),
            positions,
        };
        self.write_line(&entry)?;
        info!(
            signature = %self.signature,
            sequence_id = entry.sequence_id,
            "ledger entry appended"
        );
        Ok(entry.sequence_id)
    }

    /// Serialize first, then write the whole line with one call and sync it.
    fn write_line(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let path = &self.ledger_path;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| LedgerError::storage(parent, source))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(|source| LedgerError::storage(path, source))?;
        // A crash mid-write can leave an unterminated line; start ours on a fresh one.
        if ends_without_newline(&mut file).map_err(|source| LedgerError::storage(path, source))? {
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes())
            .and_then(|()| file.sync_data())
            .map_err(|source| LedgerError::storage(path, source))?;
        debug!(path = %path.display(), sequence_id = entry.sequence_id, "ledger line written");
        Ok(())
    }
}

fn ends_without_newline(file: &mut File) -> io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Whether the file holds any newline-terminated, non-blank line. An
/// unterminated tail is a torn write and does not count.
fn has_complete_lines(path: &Path) -> Result<bool, LedgerError> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(source) => return Err(LedgerError::storage(path, source)),
    };
    Ok(contents
        .split_inclusive(|byte| *byte == b'\n')
        .any(|line| line.ends_with(b"\n") && !line.trim_ascii().is_empty()))
}

fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>, LedgerError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(LedgerError::storage(path, source)),
    };
    let mut entries = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| LedgerError::storage(path, source))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                warn!(path = %path.display(), line = index + 1, err = %err, "skipping unparseable ledger line");
            }
        }
    }
    Ok(entries)
}
