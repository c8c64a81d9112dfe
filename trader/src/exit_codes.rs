//! Stable exit codes for trader CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed (session error, brokerage rejection, lock timeout, ...).
pub const FAILED: i32 = 1;
/// Configuration was missing or invalid; nothing was written.
pub const CONFIG: i32 = 2;
/// The account's storage (ledger directory or lock file) could not be used.
pub const STORAGE_UNAVAILABLE: i32 = 3;
