//! Order types for execution tracking.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{AccountId, ExchangeId, OrderId, PositionId};

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    /// Buy order.
    Buy,
    /// Sell order.
    Sell,
}

impl OrderSide {
    /// The side that offsets this one.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Order status in the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Order created locally but not yet acknowledged by the exchange.
    Pending,
    /// Order acknowledged and resting on the exchange.
    Open,
    /// Order completely filled.
    Filled,
    /// Order cancelled.
    Cancelled,
    /// Order rejected by the exchange or by fill validation.
    Rejected,
}

impl OrderStatus {
    /// Returns true if the order is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }

    /// Returns true while the order can still hold a capital reservation.
    #[must_use]
    pub const fn holds_reservation(&self) -> bool {
        matches!(self, Self::Pending | Self::Open)
    }
}

/// One tracked order.
///
/// Orders with no `parent_position_id` are entries and reserve capital when
/// registered with the ledger. Orders attached to a position (stops, targets,
/// exits) must not reserve again the capital already held by the parent's
/// entry order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Engine-internal order id.
    pub order_id: OrderId,
    /// Owning account.
    pub account_id: AccountId,
    /// Exchange connection the order was routed through.
    pub exchange: ExchangeId,
    /// Traded symbol.
    pub symbol: String,
    /// Buy or sell.
    pub side: OrderSide,
    /// Price the caller expected to trade at.
    pub requested_price: Decimal,
    /// Requested quantity in base units.
    pub requested_quantity: Decimal,
    /// Realized fill price, once known.
    pub filled_price: Option<Decimal>,
    /// Lifecycle status.
    pub status: OrderStatus,
    /// Capital set aside for this order while it is live.
    pub reserved_capital: Decimal,
    /// Position this order is attached to; `None` for entries.
    pub parent_position_id: Option<PositionId>,
    /// The exchange's id for this order, once acknowledged.
    pub venue_order_id: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Create a new entry order reserving `reserved_capital`.
    #[must_use]
    pub fn entry(
        account_id: AccountId,
        exchange: ExchangeId,
        symbol: impl Into<String>,
        side: OrderSide,
        requested_price: Decimal,
        requested_quantity: Decimal,
        reserved_capital: Decimal,
    ) -> Self {
        Self {
            order_id: OrderId::generate(),
            account_id,
            exchange,
            symbol: symbol.into(),
            side,
            requested_price,
            requested_quantity,
            filled_price: None,
            status: OrderStatus::Pending,
            reserved_capital,
            parent_position_id: None,
            venue_order_id: None,
            created_at: Utc::now(),
        }
    }

    /// Create an exit (or stop/target) order attached to a position.
    ///
    /// Exit orders never reserve capital; the parent entry already holds it.
    #[must_use]
    pub fn exit(
        account_id: AccountId,
        exchange: ExchangeId,
        symbol: impl Into<String>,
        side: OrderSide,
        requested_price: Decimal,
        requested_quantity: Decimal,
        parent: PositionId,
    ) -> Self {
        Self {
            order_id: OrderId::generate(),
            account_id,
            exchange,
            symbol: symbol.into(),
            side,
            requested_price,
            requested_quantity,
            filled_price: None,
            status: OrderStatus::Pending,
            reserved_capital: Decimal::ZERO,
            parent_position_id: Some(parent),
            venue_order_id: None,
            created_at: Utc::now(),
        }
    }

    /// Whether this order is an entry (opens new exposure).
    #[must_use]
    pub const fn is_entry(&self) -> bool {
        self.parent_position_id.is_none()
    }

    /// Age of the order relative to `now`.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// A confirmed execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    /// Order that produced the fill.
    pub order_id: OrderId,
    /// Position opened or reduced by the fill.
    pub position_id: PositionId,
    /// Traded symbol.
    pub symbol: String,
    /// Side of the filled order.
    pub side: OrderSide,
    /// Realized price.
    pub price: Decimal,
    /// Filled quantity in base units.
    pub quantity: Decimal,
    /// Fill timestamp.
    pub filled_at: DateTime<Utc>,
}
