//! Scheduled trading-session runner with a crash-safe position ledger.
//!
//! A driver loop asks whether a market is currently in a trading session, runs
//! a bounded decision session when it is, and records every trade in an
//! append-only per-account ledger guarded by a cross-process lock. The crate is
//! split in two:
//!
//! - **[`core`]**: Pure, deterministic logic (market calendars, session
//!   classification, conversation state, position arithmetic). No I/O.
//! - **[`io`]**: Side effects (config, ledger and lock files, transcripts,
//!   child processes, prompt templates, the brokerage).
//!
//! Orchestration modules ([`session`], [`cycle`], [`driver`], [`trade`]) tie
//! core logic to I/O to implement the CLI commands.

pub mod core;
pub mod cycle;
pub mod driver;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod retry;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod trade;
