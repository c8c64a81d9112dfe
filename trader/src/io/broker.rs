//! Brokerage collaborator.
//!
//! Every call returns either a value or a [`BrokerError`] carrying the
//! brokerage's `(status, payload)`. [`PaperBroker`] is an in-process simulated
//! brokerage that fills immediately at the requested (or quoted) price.

use std::collections::BTreeMap;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::markets::MarketSpec;
use crate::core::positions::{PositionSnapshot, Side, TradeAction};
use crate::core::types::TradeEnv;
use crate::io::ledger::LedgerEntry;

/// Generic failure status, as returned by the brokerage API.
pub const RET_ERROR: i32 = -1;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("brokerage returned status {status}: {payload}")]
pub struct BrokerError {
    pub status: i32,
    pub payload: String,
}

impl BrokerError {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            status: RET_ERROR,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Funds {
    pub cash: Decimal,
    pub market_value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerPosition {
    /// Market-qualified symbol (`HK.00700`).
    pub symbol: String,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub last_price: Decimal,
    pub prev_close: Decimal,
    /// Percent change against the previous close.
    pub change_rate: Decimal,
}

impl Quote {
    pub fn new(symbol: impl Into<String>, last_price: Decimal, prev_close: Decimal) -> Self {
        let change_rate = if prev_close.is_zero() {
            Decimal::ZERO
        } else {
            ((last_price - prev_close) / prev_close * Decimal::ONE_HUNDRED).round_dp(4)
        };
        Self {
            symbol: symbol.into(),
            last_price,
            prev_close,
            change_rate,
        }
    }
}

/// Order as submitted to the brokerage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub side: Side,
    /// Bare or market-qualified symbol.
    pub symbol: String,
    pub quantity: i64,
    /// Limit price; `None` takes the current quote.
    pub price: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Filled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub side: Side,
    pub symbol: String,
    pub quantity: i64,
    pub price: Decimal,
    pub status: OrderStatus,
}

/// Acknowledgement of an accepted order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    pub order_id: String,
    pub fill_price: Decimal,
}

/// Queries and mutations against a brokerage account.
pub trait Broker {
    fn funds(&mut self) -> Result<Funds, BrokerError>;
    fn positions(&mut self) -> Result<Vec<BrokerPosition>, BrokerError>;
    fn quote(&mut self, symbol: &str) -> Result<Quote, BrokerError>;
    fn order_history(&mut self) -> Result<Vec<OrderRecord>, BrokerError>;
    fn place_order(&mut self, order: &OrderRequest) -> Result<OrderAck, BrokerError>;
    fn cancel_order(&mut self, order_id: &str) -> Result<(), BrokerError>;
    /// Release the connection. Later calls fail.
    fn close(&mut self) -> Result<(), BrokerError>;

    /// Called with the ledger's latest snapshot while the account lock is held.
    ///
    /// Brokers with their own account state ignore it; brokers that keep none
    /// (such as [`PaperBroker`]) adopt it.
    fn reconcile(&mut self, _latest: &PositionSnapshot) {}
}

/// Simulated brokerage holding one account's cash and positions in memory.
#[derive(Debug, Clone)]
pub struct PaperBroker {
    spec: MarketSpec,
    trade_env: TradeEnv,
    cash: Decimal,
    holdings: BTreeMap<String, i64>,
    quotes: BTreeMap<String, Quote>,
    orders: Vec<OrderRecord>,
    closed: bool,
}

impl PaperBroker {
    pub fn new(spec: MarketSpec, trade_env: TradeEnv, seed: &PositionSnapshot) -> Self {
        let mut broker = Self {
            spec,
            trade_env,
            cash: Decimal::ZERO,
            holdings: BTreeMap::new(),
            quotes: BTreeMap::new(),
            orders: Vec::new(),
            closed: false,
        };
        broker.reconcile(seed);
        broker
    }

    pub fn with_quote(mut self, symbol: &str, last_price: Decimal, prev_close: Decimal) -> Self {
        let symbol = self.spec.qualify_symbol(symbol);
        self.quotes
            .insert(symbol.clone(), Quote::new(symbol, last_price, prev_close));
        self
    }

    /// Quote every symbol the ledger has traded at its most recent fill price,
    /// with the fill before it as the previous close.
    pub fn with_ledger_prices(mut self, entries: &[LedgerEntry]) -> Self {
        let mut fills: BTreeMap<String, (Decimal, Decimal)> = BTreeMap::new();
        for action in entries.iter().filter_map(|entry| entry.action.as_ref()) {
            let symbol = self.spec.qualify_symbol(&action.symbol);
            fills
                .entry(symbol)
                .and_modify(|(last, prev)| {
                    *prev = *last;
                    *last = action.price;
                })
                .or_insert((action.price, action.price));
        }
        for (symbol, (last, prev)) in fills {
            self.quotes
                .insert(symbol.clone(), Quote::new(symbol, last, prev));
        }
        self
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::new("connection closed"));
        }
        Ok(())
    }

    fn next_order_id(&self) -> String {
        format!(
            "PAPER-{}-{}",
            Utc::now().timestamp_micros(),
            self.orders.len() + 1
        )
    }

    /// Current account state in ledger form.
    pub fn ledger_snapshot(&self) -> PositionSnapshot {
        PositionSnapshot {
            cash: self.cash,
            holdings: self
                .holdings
                .iter()
                .map(|(symbol, qty)| (bare_symbol(&self.spec, symbol), *qty))
                .collect(),
        }
    }
}

impl Broker for PaperBroker {
    fn funds(&mut self) -> Result<Funds, BrokerError> {
        self.ensure_open()?;
        let market_value = self
            .holdings
            .iter()
            .filter_map(|(symbol, qty)| {
                self.quotes
                    .get(symbol)
                    .map(|quote| quote.last_price * Decimal::from(*qty))
            })
            .sum();
        Ok(Funds {
            cash: self.cash,
            market_value,
        })
    }

    fn positions(&mut self) -> Result<Vec<BrokerPosition>, BrokerError> {
        self.ensure_open()?;
        Ok(self
            .holdings
            .iter()
            .filter(|(_, qty)| **qty != 0)
            .map(|(symbol, qty)| BrokerPosition {
                symbol: symbol.clone(),
                quantity: *qty,
            })
            .collect())
    }

    fn quote(&mut self, symbol: &str) -> Result<Quote, BrokerError> {
        self.ensure_open()?;
        let symbol = self.spec.qualify_symbol(symbol);
        self.quotes
            .get(&symbol)
            .cloned()
            .ok_or_else(|| BrokerError::new(format!("no quote for {symbol}")))
    }

    fn order_history(&mut self) -> Result<Vec<OrderRecord>, BrokerError> {
        self.ensure_open()?;
        Ok(self.orders.clone())
    }

    fn place_order(&mut self, order: &OrderRequest) -> Result<OrderAck, BrokerError> {
        self.ensure_open()?;
        let symbol = self.spec.qualify_symbol(&order.symbol);
        let price = match order.price {
            Some(price) => price,
            None => self.quote(&symbol)?.last_price,
        };
        let action = TradeAction {
            kind: order.side,
            symbol: symbol.clone(),
            quantity: order.quantity,
            price,
            market: self.spec.id.clone(),
            external_order_id: String::new(),
        };
        let current = PositionSnapshot {
            cash: self.cash,
            holdings: self.holdings.clone(),
        };
        let filled = current.apply(&action).map_err(|err| {
            warn!(symbol = %symbol, err = %err, "paper order rejected");
            BrokerError::new(err.to_string())
        })?;

        let order_id = self.next_order_id();
        self.cash = filled.cash;
        self.holdings = filled.holdings;
        self.orders.push(OrderRecord {
            order_id: order_id.clone(),
            side: order.side,
            symbol: symbol.clone(),
            quantity: order.quantity,
            price,
            status: OrderStatus::Filled,
        });
        info!(
            order_id = %order_id,
            symbol = %symbol,
            side = ?order.side,
            quantity = order.quantity,
            price = %price,
            trade_env = %self.trade_env,
            "paper order filled"
        );
        Ok(OrderAck {
            order_id,
            fill_price: price,
        })
    }

    fn cancel_order(&mut self, order_id: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        // Paper orders fill on placement, so nothing is ever left to cancel.
        if self.orders.iter().any(|order| order.order_id == order_id) {
            Err(BrokerError::new(format!("order {order_id} already filled")))
        } else {
            Err(BrokerError::new(format!("unknown order {order_id}")))
        }
    }

    fn close(&mut self) -> Result<(), BrokerError> {
        self.closed = true;
        debug!("paper broker closed");
        Ok(())
    }

    fn reconcile(&mut self, latest: &PositionSnapshot) {
        self.cash = latest.cash;
        self.holdings = latest
            .holdings
            .iter()
            .map(|(symbol, qty)| (self.spec.qualify_symbol(symbol), *qty))
            .collect();
        debug!(cash = %self.cash, instruments = self.holdings.len(), "paper broker reconciled");
    }
}

/// Ledger-side symbol: the normalized code without the market prefix.
pub fn bare_symbol(spec: &MarketSpec, symbol: &str) -> String {
    let qualified = spec.qualify_symbol(symbol);
    let prefix = format!("{}.", spec.id);
    qualified
        .strip_prefix(&prefix)
        .map(str::to_string)
        .unwrap_or(qualified)
}

/// Snapshot in ledger form from the brokerage's view of the account.
///
/// Every symbol tracked in `previous` stays present (at zero if the brokerage no
/// longer reports it).
pub fn snapshot_from_broker<B: Broker + ?Sized>(
    spec: &MarketSpec,
    broker: &mut B,
    previous: &PositionSnapshot,
) -> Result<PositionSnapshot, BrokerError> {
    let funds = broker.funds()?;
    let mut holdings: BTreeMap<String, i64> = previous
        .holdings
        .keys()
        .map(|symbol| (symbol.clone(), 0))
        .collect();
    for position in broker.positions()? {
        holdings.insert(bare_symbol(spec, &position.symbol), position.quantity);
    }
    Ok(PositionSnapshot {
        cash: funds.cash,
        holdings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::markets::{MarketId, MarketTable};
    use rust_decimal_macros::dec;

    fn hk() -> MarketSpec {
        MarketTable::builtin()
            .get(&MarketId::new("HK").unwrap())
            .unwrap()
            .clone()
    }

    fn broker() -> PaperBroker {
        PaperBroker::new(
            hk(),
            TradeEnv::Simulate,
            &PositionSnapshot::initial(dec!(10000), &["00700", "09988"]),
        )
        .with_quote("700", dec!(320), dec!(300))
    }

    #[test]
    fn change_rate_is_numeric_percent() {
        let quote = broker().quote("00700").unwrap();
        assert_eq!(quote.symbol, "HK.00700");
        assert_eq!(quote.change_rate, dec!(6.6667));
    }

    #[test]
    fn buy_at_quote_then_report_positions() {
        let mut broker = broker();
        let ack = broker
            .place_order(&OrderRequest {
                side: Side::Buy,
                symbol: "700".to_string(),
                quantity: 10,
                price: None,
            })
            .unwrap();
        assert_eq!(ack.fill_price, dec!(320));

        assert_eq!(broker.funds().unwrap().cash, dec!(6800));
        assert_eq!(broker.funds().unwrap().market_value, dec!(3200));
        assert_eq!(
            broker.positions().unwrap(),
            vec![BrokerPosition {
                symbol: "HK.00700".to_string(),
                quantity: 10
            }]
        );
        assert_eq!(broker.ledger_snapshot().quantity("00700"), 10);
        let history = broker.order_history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, OrderStatus::Filled);
        let filled = broker.cancel_order(&ack.order_id).unwrap_err();
        assert!(filled.payload.contains("already filled"));
        let unknown = broker.cancel_order("PAPER-0-9").unwrap_err();
        assert!(unknown.payload.contains("unknown order"));
    }

    #[test]
    fn oversell_is_a_broker_error() {
        let mut broker = broker();
        let err = broker
            .place_order(&OrderRequest {
                side: Side::Sell,
                symbol: "09988".to_string(),
                quantity: 1,
                price: Some(dec!(80)),
            })
            .unwrap_err();
        assert_eq!(err.status, RET_ERROR);
        assert!(err.payload.contains("insufficient"));
        assert_eq!(broker.funds().unwrap().cash, dec!(10000));
    }

    #[test]
    fn ledger_prices_quote_the_latest_fill() {
        let fill = |id: u64, price: Decimal| LedgerEntry {
            sequence_id: id,
            timestamp: Utc::now().fixed_offset(),
            account: None,
            action: Some(TradeAction {
                kind: Side::Buy,
                symbol: "00700".to_string(),
                quantity: 1,
                price,
                market: MarketId::new("HK").unwrap(),
                external_order_id: String::new(),
            }),
            positions: PositionSnapshot::initial(dec!(0), &["00700"]),
        };
        let mut broker = PaperBroker::new(
            hk(),
            TradeEnv::Simulate,
            &PositionSnapshot::initial(dec!(10000), &["00700"]),
        )
        .with_ledger_prices(&[fill(1, dec!(300)), fill(2, dec!(330))]);

        let quote = broker.quote("700").unwrap();
        assert_eq!(quote.last_price, dec!(330));
        assert_eq!(quote.prev_close, dec!(300));
        assert!(broker.quote("09988").is_err());

        let ack = broker
            .place_order(&OrderRequest {
                side: Side::Buy,
                symbol: "00700".to_string(),
                quantity: 2,
                price: None,
            })
            .unwrap();
        assert_eq!(ack.fill_price, dec!(330));
    }

    #[test]
    fn market_order_without_quote_is_rejected() {
        let mut broker = PaperBroker::new(
            hk(),
            TradeEnv::Simulate,
            &PositionSnapshot::initial(dec!(10000), &["09988"]),
        );
        let err = broker
            .place_order(&OrderRequest {
                side: Side::Buy,
                symbol: "09988".to_string(),
                quantity: 1,
                price: None,
            })
            .unwrap_err();
        assert!(err.payload.contains("no quote"));
        assert!(broker.order_history().unwrap().is_empty());
    }

    #[test]
    fn closed_broker_rejects_calls() {
        let mut broker = broker();
        broker.close().unwrap();
        assert!(broker.funds().is_err());
    }

    #[test]
    fn snapshot_keeps_tracked_symbols() {
        let mut broker = broker();
        let previous = PositionSnapshot::initial(dec!(10000), &["00700", "09988"]);
        broker
            .place_order(&OrderRequest {
                side: Side::Buy,
                symbol: "HK.00700".to_string(),
                quantity: 1,
                price: Some(dec!(100)),
            })
            .unwrap();

        let snapshot = snapshot_from_broker(&hk(), &mut broker, &previous).unwrap();
        assert_eq!(snapshot.cash, dec!(9900));
        assert_eq!(snapshot.quantity("00700"), 1);
        assert_eq!(snapshot.holdings.get("09988"), Some(&0));
    }
}
