//! Tracing setup for the trader binary.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Operational diagnostics via `RUST_LOG`, output
//!   to stderr. Not persisted.
//!
//! - **Ledger and transcripts (`io/ledger`, `io/transcript`)**: Product
//!   artifacts under the data directory. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset; a long-running `trader loop` reports each cycle.
pub const DEFAULT_FILTER: &str = "info";
/// Filter used for `--verbose`.
pub const VERBOSE_FILTER: &str = "info,trader=debug";

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins over `default_filter`. Output: stderr, compact format, with
/// span fields (`signature`, `market`, `session_id`) on every event.
///
/// # Example
/// ```bash
/// RUST_LOG=trader::io::ledger=debug trader record buy AAPL 10 --price 190
/// ```
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
