//! Shared deterministic types for trader core logic.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::markets::MarketId;

/// Brokerage environment an account trades against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeEnv {
    #[default]
    Simulate,
    Real,
}

impl TradeEnv {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeEnv::Simulate => "SIMULATE",
            TradeEnv::Real => "REAL",
        }
    }
}

impl fmt::Display for TradeEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical trading identity: the namespace for a ledger and its lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub signature: String,
    pub market: MarketId,
    pub trade_env: TradeEnv,
}

impl Account {
    pub fn context(&self) -> AccountContext {
        AccountContext {
            market: self.market.clone(),
            trade_env: self.trade_env,
        }
    }
}

/// Market and environment recorded alongside ledger and transcript entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountContext {
    pub market: MarketId,
    pub trade_env: TradeEnv,
}

/// States of a single controller run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    /// The decision step emitted the stop token.
    StoppedBySignal,
    /// `max_steps` elapsed without a stop token.
    StoppedByStepLimit,
    /// A step exhausted its retries.
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionState::Running)
    }
}
