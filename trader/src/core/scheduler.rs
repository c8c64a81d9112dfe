//! Session admission: classify an instant into a named trading session.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

use crate::core::calendar::{is_weekend, minute_of_day, to_market_local};
use crate::core::markets::{MarketId, MarketSpec, MarketTable, MarketTableError};

pub const WEEKEND: &str = "WEEKEND";
pub const CLOSED: &str = "CLOSED";

/// Classification of one instant for one market. Recomputed on every query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarketSession {
    pub market: MarketId,
    pub session_name: String,
    pub is_trading: bool,
    pub is_weekend: bool,
    /// Market-local wall time of the classified instant.
    pub local_time: NaiveDateTime,
}

/// Read-only view over a validated [`MarketTable`].
#[derive(Debug, Clone, Default)]
pub struct MarketScheduler {
    table: MarketTable,
}

impl MarketScheduler {
    pub fn new(table: MarketTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &MarketTable {
        &self.table
    }

    /// Classify `instant` for `market`. Fails only for a market missing from the table.
    pub fn classify(
        &self,
        market: &MarketId,
        instant: DateTime<Utc>,
    ) -> Result<MarketSession, MarketTableError> {
        let spec = self.table.get(market)?;
        Ok(classify_with(spec, instant))
    }
}

/// Weekends override the window table; otherwise the first containing window wins.
pub fn classify_with(spec: &MarketSpec, instant: DateTime<Utc>) -> MarketSession {
    let local = to_market_local(instant, spec.zone);
    let local_time = local.naive_local();

    if is_weekend(&local) {
        return MarketSession {
            market: spec.id.clone(),
            session_name: WEEKEND.to_string(),
            is_trading: false,
            is_weekend: true,
            local_time,
        };
    }

    let minute = minute_of_day(&local);
    let (session_name, is_trading) = match spec.windows.iter().find(|w| w.contains(minute)) {
        Some(window) => (window.name.clone(), true),
        None => (CLOSED.to_string(), false),
    };
    MarketSession {
        market: spec.id.clone(),
        session_name,
        is_trading,
        is_weekend: false,
        local_time,
    }
}
