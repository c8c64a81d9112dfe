//! Position snapshots and the trade actions that move between them.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::markets::MarketId;

pub const CASH: &str = "CASH";

/// Holdings after an action: cash plus an integer quantity per instrument.
///
/// Serialized as one flat map with the distinguished `"CASH"` key, e.g.
/// `{"CASH": 99500.0, "X": 10, "Y": 0}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    #[serde(rename = "CASH", with = "rust_decimal::serde::float")]
    pub cash: Decimal,
    #[serde(flatten)]
    pub holdings: BTreeMap<String, i64>,
}

impl PositionSnapshot {
    /// Initial allocation: all cash, zero of every tracked instrument.
    pub fn initial<S: AsRef<str>>(cash: Decimal, symbols: &[S]) -> Self {
        Self {
            cash,
            holdings: symbols
                .iter()
                .map(|symbol| (symbol.as_ref().to_string(), 0))
                .collect(),
        }
    }

    pub fn quantity(&self, symbol: &str) -> i64 {
        self.holdings.get(symbol).copied().unwrap_or(0)
    }

    /// Paper accounting for an immediate fill at `action.price`.
    pub fn apply(&self, action: &TradeAction) -> Result<Self, FillError> {
        if action.quantity <= 0 {
            return Err(FillError::NonPositiveQuantity(action.quantity));
        }
        if action.price.is_sign_negative() {
            return Err(FillError::NegativePrice(action.price));
        }
        let notional = Decimal::from(action.quantity)
            .checked_mul(action.price)
            .ok_or(FillError::Overflow)?;
        let held = self.quantity(&action.symbol);
        let (cash, quantity) = match action.kind {
            Side::Buy => {
                if notional > self.cash {
                    return Err(FillError::InsufficientCash {
                        required: notional,
                        available: self.cash,
                    });
                }
                (
                    self.cash.checked_sub(notional),
                    held.checked_add(action.quantity),
                )
            }
            Side::Sell => {
                if action.quantity > held {
                    return Err(FillError::InsufficientQuantity {
                        symbol: action.symbol.clone(),
                        requested: action.quantity,
                        held,
                    });
                }
                (
                    self.cash.checked_add(notional),
                    held.checked_sub(action.quantity),
                )
            }
        };
        let mut next = self.clone();
        next.cash = cash.ok_or(FillError::Overflow)?;
        next.holdings
            .insert(action.symbol.clone(), quantity.ok_or(FillError::Overflow)?);
        Ok(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// The trade that produced a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeAction {
    #[serde(alias = "action")]
    pub kind: Side,
    pub symbol: String,
    #[serde(alias = "amount")]
    pub quantity: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub market: MarketId,
    #[serde(default, alias = "order_id")]
    pub external_order_id: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FillError {
    #[error("quantity must be positive (got {0})")]
    NonPositiveQuantity(i64),
    #[error("price must not be negative (got {0})")]
    NegativePrice(Decimal),
    #[error("insufficient cash: need {required}, have {available}")]
    InsufficientCash { required: Decimal, available: Decimal },
    #[error("insufficient {symbol}: selling {requested}, holding {held}")]
    InsufficientQuantity {
        symbol: String,
        requested: i64,
        held: i64,
    },
    #[error("order value or resulting position is out of range")]
    Overflow,
}
