//! Strategy intent boundary.
//!
//! Indicator math and sizing policy are out of scope for the engine; a
//! strategy is just something that looks at one (account, exchange) pair's
//! state and emits intents. The orchestrator routes intents through the
//! gateway, which applies all safety checks; a strategy cannot bypass
//! them.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::{AccountId, ExchangeId, Order, OrderSide, Position};

/// What a strategy wants done, in engine terms.
#[derive(Debug, Clone)]
pub enum Intent {
    /// Open `quantity` of `symbol` in `side` direction, expecting to trade
    /// near `expected_price`.
    Open {
        /// Symbol to trade.
        symbol: String,
        /// Direction.
        side: OrderSide,
        /// Quantity in base units.
        quantity: Decimal,
        /// Price the strategy expects; used for reservation sizing and
        /// slippage validation.
        expected_price: Decimal,
    },
    /// Close the open position in `symbol`.
    Close {
        /// Symbol to close.
        symbol: String,
    },
}

/// Snapshot of one pair's state handed to the strategy each cycle.
#[derive(Debug, Clone)]
pub struct PairView {
    /// Account under decision.
    pub account: AccountId,
    /// Exchange connection under decision.
    pub exchange: ExchangeId,
    /// Reported available balance.
    pub balance: Decimal,
    /// Positions under management.
    pub positions: Vec<Position>,
    /// Orders currently holding reservations.
    pub open_orders: Vec<Order>,
}

/// A pluggable decision rule for one cycle.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Decide what, if anything, to do for this pair right now.
    async fn decide(&self, view: &PairView) -> Vec<Intent>;
}

/// The do-nothing strategy; useful as a default and in supervision tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct HoldStrategy;

#[async_trait]
impl Strategy for HoldStrategy {
    async fn decide(&self, _view: &PairView) -> Vec<Intent> {
        Vec::new()
    }
}
