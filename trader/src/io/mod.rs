//! I/O for trader commands: files, locks, child processes, the brokerage.

pub mod broker;
pub mod config;
pub mod decision;
pub mod ledger;
pub mod lock;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod transcript;
