//! Order placement recorded in the ledger under the account lock.

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::markets::MarketSpec;
use crate::core::positions::{PositionSnapshot, TradeAction};
use crate::core::types::Account;
use crate::io::broker::{Broker, bare_symbol, snapshot_from_broker};
use crate::io::ledger::{LedgerError, LedgerStore};

pub use crate::io::broker::OrderRequest;

/// A placed order and the ledger entry that records it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedTrade {
    pub sequence_id: u64,
    pub action: TradeAction,
    pub positions: PositionSnapshot,
}

/// Place `order` and append the resulting position to the ledger.
///
/// The account lock is held from before the order is placed until the entry is
/// written, so the recorded snapshot is the brokerage's post-fill state and no
/// other writer can interleave. A brokerage rejection appends nothing.
#[instrument(skip_all, fields(signature = %account.signature, market = %account.market, symbol = %order.symbol))]
pub fn execute_order<B: Broker + ?Sized>(
    store: &LedgerStore,
    account: &Account,
    spec: &MarketSpec,
    broker: &mut B,
    order: &OrderRequest,
) -> Result<ExecutedTrade> {
    let writer = store.lock(&account.signature)?;
    let previous = writer
        .latest()?
        .ok_or_else(|| LedgerError::NotRegistered {
            signature: account.signature.clone(),
        })?
        .positions;
    broker.reconcile(&previous);

    let ack = match broker.place_order(order) {
        Ok(ack) => ack,
        Err(err) => {
            warn!(status = err.status, payload = %err.payload, "order rejected, nothing recorded");
            return Err(err).context("place order");
        }
    };
    let positions = snapshot_from_broker(spec, broker, &previous)
        .context("query positions after fill")?;

    let action = TradeAction {
        kind: order.side,
        symbol: bare_symbol(spec, &order.symbol),
        quantity: order.quantity,
        price: ack.fill_price,
        market: account.market.clone(),
        external_order_id: ack.order_id,
    };
    let sequence_id = writer.append(action.clone(), positions.clone())?;
    info!(
        sequence_id,
        order_id = %action.external_order_id,
        cash = %positions.cash,
        "trade recorded"
    );
    Ok(ExecutedTrade {
        sequence_id,
        action,
        positions,
    })
}
