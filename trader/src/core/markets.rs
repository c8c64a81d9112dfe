//! Declarative per-market records: zone, session windows and symbol rule.
//!
//! Every market-specific decision reads from a [`MarketSpec`] looked up by
//! [`MarketId`]; nothing else in the crate branches on a market name.

use std::collections::BTreeMap;
use std::fmt;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MINUTES_PER_DAY: u32 = 24 * 60;

const POPULAR_HK_SYMBOLS: &[&str] = &[
    "00700", "09988", "09618", "03690", "09888", "01810", "02318", "00005", "00939", "01398",
    "03988", "00388", "00941", "00883", "00857", "02628", "01299", "00027", "01928", "02020",
    "09999", "00981", "09992", "02015", "09866", "09868", "01024", "06618", "02269", "01211",
];

const POPULAR_US_SYMBOLS: &[&str] = &[
    "AAPL", "MSFT", "GOOGL", "AMZN", "NVDA", "META", "TSLA", "AMD", "NFLX", "INTC", "BABA", "JD",
    "PDD", "NIO", "XPEV", "LI", "BIDU", "TME", "BILI", "COIN", "UBER", "ABNB", "SNOW", "CRM",
    "ORCL", "IBM", "V", "MA", "JPM", "BAC",
];

/// Errors raised while building or querying the market table.
///
/// All of these are configuration errors: they surface at startup, before any
/// ledger or transcript I/O.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MarketTableError {
    #[error("market id must be non-empty")]
    EmptyMarketId,
    #[error("unknown market '{0}'")]
    UnknownMarket(String),
    #[error("market {market}: unknown timezone '{zone}'")]
    UnknownTimezone { market: String, zone: String },
    #[error("market {market}: invalid time '{value}' (expected HH:MM)")]
    InvalidTime { market: String, value: String },
    #[error("market {market}: window '{name}' must satisfy start < end <= 24:00")]
    EmptyWindow { market: String, name: String },
    #[error("market {market}: window name must be non-empty")]
    UnnamedWindow { market: String },
    #[error("market {market}: windows '{first}' and '{second}' overlap")]
    OverlappingWindows {
        market: String,
        first: String,
        second: String,
    },
}

/// Upper-cased market identifier (`"HK"`, `"US"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MarketId(String);

impl MarketId {
    pub fn new(raw: &str) -> Result<Self, MarketTableError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(MarketTableError::EmptyMarketId);
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MarketId {
    type Error = MarketTableError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<MarketId> for String {
    fn from(value: MarketId) -> Self {
        value.0
    }
}

impl fmt::Display for MarketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Named half-open window `[start_minute, end_minute)` in local minutes since midnight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionWindow {
    pub name: String,
    pub start_minute: u32,
    pub end_minute: u32,
}

impl SessionWindow {
    pub fn new(name: &str, start_minute: u32, end_minute: u32) -> Self {
        Self {
            name: name.to_string(),
            start_minute,
            end_minute,
        }
    }

    /// Build a window from `"HH:MM"` bounds.
    pub fn from_hhmm(
        market: &MarketId,
        name: &str,
        start: &str,
        end: &str,
    ) -> Result<Self, MarketTableError> {
        let start_minute = parse_hhmm(market, start)?;
        let end_minute = parse_hhmm(market, end)?;
        Ok(Self::new(name, start_minute, end_minute))
    }

    pub fn contains(&self, minute: u32) -> bool {
        self.start_minute <= minute && minute < self.end_minute
    }

    fn overlaps(&self, other: &SessionWindow) -> bool {
        self.start_minute < other.end_minute && other.start_minute < self.end_minute
    }
}

impl fmt::Display for SessionWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} - {}",
            self.name,
            format_hhmm(self.start_minute),
            format_hhmm(self.end_minute)
        )
    }
}

/// `"24:00"` is accepted as an end-of-day bound.
fn parse_hhmm(market: &MarketId, value: &str) -> Result<u32, MarketTableError> {
    let invalid = || MarketTableError::InvalidTime {
        market: market.to_string(),
        value: value.to_string(),
    };
    let (hours, minutes) = value.trim().split_once(':').ok_or_else(invalid)?;
    let hours: u32 = hours.parse().map_err(|_| invalid())?;
    let minutes: u32 = minutes.parse().map_err(|_| invalid())?;
    if minutes >= 60 {
        return Err(invalid());
    }
    let total = hours * 60 + minutes;
    if total > MINUTES_PER_DAY {
        return Err(invalid());
    }
    Ok(total)
}

pub fn format_hhmm(minute: u32) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

/// How a bare symbol is normalized before it is qualified with the market id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SymbolStyle {
    /// Numeric codes left-padded with zeros to five digits (`700` -> `00700`).
    ZeroPadded,
    /// Tickers upper-cased (`aapl` -> `AAPL`).
    Uppercase,
}

impl SymbolStyle {
    pub fn normalize(self, symbol: &str) -> String {
        let symbol = symbol.trim();
        match self {
            SymbolStyle::ZeroPadded => {
                let digits = symbol.trim_start_matches('0');
                format!("{digits:0>5}")
            }
            SymbolStyle::Uppercase => symbol.to_ascii_uppercase(),
        }
    }
}

/// Everything the crate knows about one market.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSpec {
    pub id: MarketId,
    pub zone: Tz,
    /// Evaluated in order; the first window containing the local minute wins.
    pub windows: Vec<SessionWindow>,
    pub symbol_style: SymbolStyle,
    pub default_symbols: Vec<String>,
}

impl MarketSpec {
    /// Validate and build a market record. Overlapping or empty windows are rejected.
    pub fn new(
        id: MarketId,
        zone: Tz,
        windows: Vec<SessionWindow>,
        symbol_style: SymbolStyle,
        default_symbols: Vec<String>,
    ) -> Result<Self, MarketTableError> {
        for window in &windows {
            if window.name.trim().is_empty() {
                return Err(MarketTableError::UnnamedWindow {
                    market: id.to_string(),
                });
            }
            if window.start_minute >= window.end_minute || window.end_minute > MINUTES_PER_DAY {
                return Err(MarketTableError::EmptyWindow {
                    market: id.to_string(),
                    name: window.name.clone(),
                });
            }
        }
        for (i, first) in windows.iter().enumerate() {
            if let Some(second) = windows[i + 1..].iter().find(|w| first.overlaps(w)) {
                return Err(MarketTableError::OverlappingWindows {
                    market: id.to_string(),
                    first: first.name.clone(),
                    second: second.name.clone(),
                });
            }
        }
        Ok(Self {
            id,
            zone,
            windows,
            symbol_style,
            default_symbols,
        })
    }

    pub fn parse_zone(id: &MarketId, zone: &str) -> Result<Tz, MarketTableError> {
        zone.parse::<Tz>()
            .map_err(|_| MarketTableError::UnknownTimezone {
                market: id.to_string(),
                zone: zone.to_string(),
            })
    }

    /// Market-qualified symbol as the brokerage expects it (`HK.00700`, `US.AAPL`).
    pub fn qualify_symbol(&self, symbol: &str) -> String {
        let symbol = symbol.trim();
        let prefix = format!("{}.", self.id);
        let bare = match symbol.get(..prefix.len()) {
            Some(head) if head.eq_ignore_ascii_case(&prefix) => &symbol[prefix.len()..],
            _ => symbol,
        };
        format!("{}{}", prefix, self.symbol_style.normalize(bare))
    }

    fn us() -> Self {
        let id = MarketId("US".to_string());
        Self {
            id,
            zone: chrono_tz::America::New_York,
            windows: vec![
                SessionWindow::new("PRE_MARKET", 4 * 60, 9 * 60 + 30),
                SessionWindow::new("REGULAR", 9 * 60 + 30, 16 * 60),
                SessionWindow::new("AFTER_HOURS", 16 * 60, 20 * 60),
            ],
            symbol_style: SymbolStyle::Uppercase,
            default_symbols: POPULAR_US_SYMBOLS.iter().map(ToString::to_string).collect(),
        }
    }

    fn hk() -> Self {
        let id = MarketId("HK".to_string());
        Self {
            id,
            zone: chrono_tz::Asia::Hong_Kong,
            windows: vec![
                SessionWindow::new("MORNING", 9 * 60 + 30, 12 * 60),
                SessionWindow::new("AFTERNOON", 13 * 60, 16 * 60),
            ],
            symbol_style: SymbolStyle::ZeroPadded,
            default_symbols: POPULAR_HK_SYMBOLS.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Lookup table of validated market records.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketTable {
    markets: BTreeMap<MarketId, MarketSpec>,
}

impl Default for MarketTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl MarketTable {
    /// Hong Kong and US equities.
    pub fn builtin() -> Self {
        let mut markets = BTreeMap::new();
        for spec in [MarketSpec::hk(), MarketSpec::us()] {
            markets.insert(spec.id.clone(), spec);
        }
        Self { markets }
    }

    /// Add a market or replace an existing one.
    pub fn insert(&mut self, spec: MarketSpec) {
        self.markets.insert(spec.id.clone(), spec);
    }

    pub fn get(&self, id: &MarketId) -> Result<&MarketSpec, MarketTableError> {
        self.markets
            .get(id)
            .ok_or_else(|| MarketTableError::UnknownMarket(id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &MarketSpec> {
        self.markets.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> MarketId {
        MarketId::new(raw).expect("market id")
    }

    #[test]
    fn market_ids_are_upper_cased() {
        assert_eq!(id(" hk ").as_str(), "HK");
        assert_eq!(MarketId::new("  "), Err(MarketTableError::EmptyMarketId));
    }

    #[test]
    fn builtin_tables_pass_validation() {
        for spec in MarketTable::builtin().iter() {
            let rebuilt = MarketSpec::new(
                spec.id.clone(),
                spec.zone,
                spec.windows.clone(),
                spec.symbol_style,
                spec.default_symbols.clone(),
            )
            .expect("builtin market is valid");
            assert_eq!(&rebuilt, spec);
        }
    }

    #[test]
    fn overlapping_windows_are_rejected() {
        let err = MarketSpec::new(
            id("XX"),
            chrono_tz::UTC,
            vec![
                SessionWindow::new("A", 600, 700),
                SessionWindow::new("B", 690, 800),
            ],
            SymbolStyle::Uppercase,
            Vec::new(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            MarketTableError::OverlappingWindows {
                market: "XX".to_string(),
                first: "A".to_string(),
                second: "B".to_string(),
            }
        );
    }

    #[test]
    fn adjacent_windows_do_not_overlap() {
        MarketSpec::new(
            id("XX"),
            chrono_tz::UTC,
            vec![
                SessionWindow::new("A", 600, 700),
                SessionWindow::new("B", 700, 800),
            ],
            SymbolStyle::Uppercase,
            Vec::new(),
        )
        .expect("adjacent windows are fine");
    }

    #[test]
    fn empty_window_is_rejected() {
        let err = MarketSpec::new(
            id("XX"),
            chrono_tz::UTC,
            vec![SessionWindow::new("A", 700, 700)],
            SymbolStyle::Uppercase,
            Vec::new(),
        )
        .unwrap_err();
        assert!(matches!(err, MarketTableError::EmptyWindow { .. }));
    }

    #[test]
    fn parses_hhmm_bounds() {
        let window = SessionWindow::from_hhmm(&id("HK"), "MORNING", "09:30", "12:00").unwrap();
        assert_eq!((window.start_minute, window.end_minute), (570, 720));
        assert_eq!(window.to_string(), "MORNING: 09:30 - 12:00");

        let end_of_day = SessionWindow::from_hhmm(&id("HK"), "LATE", "23:00", "24:00").unwrap();
        assert_eq!(end_of_day.end_minute, MINUTES_PER_DAY);

        assert!(SessionWindow::from_hhmm(&id("HK"), "BAD", "9h30", "12:00").is_err());
        assert!(SessionWindow::from_hhmm(&id("HK"), "BAD", "09:75", "12:00").is_err());
    }

    #[test]
    fn unknown_timezone_is_a_config_error() {
        let err = MarketSpec::parse_zone(&id("XX"), "Mars/Olympus").unwrap_err();
        assert!(matches!(err, MarketTableError::UnknownTimezone { .. }));
    }

    #[test]
    fn qualifies_symbols_per_market_rule() {
        let table = MarketTable::builtin();
        let hk = table.get(&id("HK")).unwrap();
        let us = table.get(&id("US")).unwrap();

        assert_eq!(hk.qualify_symbol("700"), "HK.00700");
        assert_eq!(hk.qualify_symbol("00700"), "HK.00700");
        assert_eq!(hk.qualify_symbol("HK.00700"), "HK.00700");
        assert_eq!(us.qualify_symbol("aapl"), "US.AAPL");
        assert_eq!(hk.qualify_symbol("hk.700"), "HK.00700");
        assert_eq!(us.qualify_symbol(" us.msft "), "US.MSFT");
    }

    #[test]
    fn unknown_market_lookup_fails() {
        let table = MarketTable::builtin();
        assert_eq!(
            table.get(&id("JP")),
            Err(MarketTableError::UnknownMarket("JP".to_string()))
        );
    }
}
