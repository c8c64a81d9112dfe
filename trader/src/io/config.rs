//! Trader configuration (`trader.toml`).
//!
//! Every table is optional except the accounts: either `[account]` or at least
//! one `[[accounts]]` entry must carry a `signature`. [`load_config`] validates
//! the whole file, including any `[markets.<ID>]` overrides, before callers
//! touch the ledger or transcripts.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::markets::{
    MarketId, MarketSpec, MarketTable, MarketTableError, SessionWindow, SymbolStyle,
};
use crate::core::types::{Account, TradeEnv};
use crate::retry::RetryPolicy;
use crate::session::SessionConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("account.signature is required")]
    MissingSignature,
    #[error("account.signature '{0}' must not contain path separators or start with '.'")]
    InvalidSignature(String),
    #[error("account.initial_cash must not be negative (got {0})")]
    NegativeCash(Decimal),
    #[error("{0} must be > 0")]
    ZeroValue(&'static str),
    #[error("duplicate account signature '{0}'")]
    DuplicateSignature(String),
    #[error("no configured account has signature '{0}'")]
    UnknownAccount(String),
    #[error("decision.command must be a non-empty array")]
    EmptyCommand,
    #[error("agent.stop_token must not be empty")]
    EmptyStopToken,
    #[error(transparent)]
    Market(#[from] MarketTableError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TraderConfig {
    /// Primary account; may be left out when `accounts` is non-empty.
    pub account: AccountConfig,
    /// Further accounts, each with its own ledger and transcripts.
    pub accounts: Vec<AccountConfig>,
    pub agent: AgentConfig,
    pub schedule: ScheduleConfig,
    pub storage: StorageConfig,
    pub decision: DecisionConfig,
    /// Market overrides keyed by market id; merged over the built-in table.
    pub markets: BTreeMap<String, MarketConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AccountConfig {
    pub signature: String,
    pub market: String,
    pub trade_env: TradeEnv,
    #[serde(with = "rust_decimal::serde::float")]
    pub initial_cash: Decimal,
    /// Tracked instruments; empty means the market's default watch list.
    pub symbols: Vec<String>,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            signature: String::new(),
            market: "HK".to_string(),
            trade_env: TradeEnv::Simulate,
            initial_cash: Decimal::from(100_000),
            symbols: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub max_steps: u32,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub stop_token: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            max_steps: session.max_steps,
            max_retries: session.retry.max_retries,
            base_delay_ms: session.retry.base_delay.as_millis() as u64,
            stop_token: session.stop_token,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
    pub only_trading_hours: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            only_trading_hours: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Bound on ledger lock waits; unset blocks until the lock is free.
    pub lock_timeout_ms: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/agent_data"),
            lock_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DecisionConfig {
    /// Program and arguments, e.g. `["python3", "agent_step.py"]`.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 10 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarketConfig {
    pub timezone: String,
    pub symbol_style: SymbolStyle,
    pub windows: Vec<WindowConfig>,
    #[serde(default)]
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowConfig {
    pub name: String,
    pub start: String,
    pub end: String,
}

impl TraderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let table = self.market_table()?;
        let mut seen = BTreeSet::new();
        for account in self.account_configs() {
            account.validate(&table)?;
            let signature = account.signature.trim();
            if !seen.insert(signature) {
                return Err(ConfigError::DuplicateSignature(signature.to_string()));
            }
        }
        if self.agent.max_steps == 0 {
            return Err(ConfigError::ZeroValue("agent.max_steps"));
        }
        if self.agent.stop_token.trim().is_empty() {
            return Err(ConfigError::EmptyStopToken);
        }
        if self.schedule.interval_secs == 0 {
            return Err(ConfigError::ZeroValue("schedule.interval_secs"));
        }
        if self.storage.lock_timeout_ms == Some(0) {
            return Err(ConfigError::ZeroValue("storage.lock_timeout_ms"));
        }
        if self.decision.timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("decision.timeout_secs"));
        }
        if self.decision.output_limit_bytes == 0 {
            return Err(ConfigError::ZeroValue("decision.output_limit_bytes"));
        }
        Ok(())
    }

    /// Every configured account, primary first.
    ///
    /// An unsigned `[account]` is skipped when `[[accounts]]` lists others.
    pub fn account_configs(&self) -> Vec<&AccountConfig> {
        let primary = (!self.account.signature.trim().is_empty() || self.accounts.is_empty())
            .then_some(&self.account);
        primary.into_iter().chain(&self.accounts).collect()
    }

    /// The account single-account commands act on.
    pub fn primary_account(&self) -> &AccountConfig {
        if self.account.signature.trim().is_empty() {
            self.accounts.first().unwrap_or(&self.account)
        } else {
            &self.account
        }
    }

    /// Narrow the config to the account with `signature`.
    pub fn select_account(&mut self, signature: &str) -> Result<(), ConfigError> {
        let wanted = signature.trim();
        let selected = self
            .account_configs()
            .into_iter()
            .find(|account| account.signature.trim() == wanted)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownAccount(wanted.to_string()))?;
        self.account = selected;
        self.accounts.clear();
        Ok(())
    }

    /// Mutable access to every account entry, for command-line overrides.
    pub fn account_configs_mut(&mut self) -> impl Iterator<Item = &mut AccountConfig> {
        std::iter::once(&mut self.account).chain(self.accounts.iter_mut())
    }

    /// Built-in markets with the configured overrides applied.
    pub fn market_table(&self) -> Result<MarketTable, ConfigError> {
        let mut table = MarketTable::builtin();
        for (raw_id, market) in &self.markets {
            table.insert(market.to_spec(MarketId::new(raw_id)?)?);
        }
        Ok(table)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_steps: self.agent.max_steps,
            retry: RetryPolicy {
                max_retries: self.agent.max_retries,
                base_delay: Duration::from_millis(self.agent.base_delay_ms),
            },
            stop_token: self.agent.stop_token.clone(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.schedule.interval_secs)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.storage.lock_timeout_ms.map(Duration::from_millis)
    }
}

impl AccountConfig {
    fn validate(&self, table: &MarketTable) -> Result<(), ConfigError> {
        let signature = self.signature.trim();
        if signature.is_empty() {
            return Err(ConfigError::MissingSignature);
        }
        if signature.contains(['/', '\\']) || signature.starts_with('.') {
            return Err(ConfigError::InvalidSignature(signature.to_string()));
        }
        if self.initial_cash.is_sign_negative() {
            return Err(ConfigError::NegativeCash(self.initial_cash));
        }
        table.get(&self.market_id()?)?;
        Ok(())
    }

    pub fn market_id(&self) -> Result<MarketId, ConfigError> {
        Ok(MarketId::new(&self.market)?)
    }

    pub fn account(&self) -> Result<Account, ConfigError> {
        Ok(Account {
            signature: self.signature.trim().to_string(),
            market: self.market_id()?,
            trade_env: self.trade_env,
        })
    }

    /// Configured symbols, or the market's default watch list.
    pub fn symbols(&self, spec: &MarketSpec) -> Vec<String> {
        if self.symbols.is_empty() {
            spec.default_symbols.clone()
        } else {
            self.symbols.clone()
        }
    }
}

impl MarketConfig {
    fn to_spec(&self, id: MarketId) -> Result<MarketSpec, MarketTableError> {
        let zone = MarketSpec::parse_zone(&id, &self.timezone)?;
        let windows = self
            .windows
            .iter()
            .map(|w| SessionWindow::from_hhmm(&id, &w.name, &w.start, &w.end))
            .collect::<Result<Vec<_>, _>>()?;
        MarketSpec::new(id, zone, windows, self.symbol_style, self.symbols.clone())
    }
}

/// Load and validate config from a TOML file.
///
/// A missing file is an error: there is no sensible default account.
pub fn load_config(path: &Path) -> Result<TraderConfig> {
    let cfg = read_config(path)?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Parse without validating, so callers can apply overrides first.
pub fn read_config(path: &Path) -> Result<TraderConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&contents)?)
}

pub fn parse_config(contents: &str) -> Result<TraderConfig> {
    let cfg: TraderConfig = toml::from_str(contents).map_err(ConfigError::from)?;
    cfg.validate()?;
    Ok(cfg)
}
