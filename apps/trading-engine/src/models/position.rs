//! Position and zombie-asset types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{AccountId, ExchangeId, OrderId, OrderSide, PositionId};

/// How a position came under local management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionSource {
    /// Opened by a strategy decision through the gateway.
    StrategyOpened,
    /// Reconstructed from exchange state during reconciliation.
    Adopted,
    /// Provenance unknown (should only appear in diagnostics).
    Unknown,
}

/// One open position under management.
///
/// Adopted positions carry the market price at adoption time as a synthetic
/// entry price, so their P&L starts at zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Engine-internal position id.
    pub position_id: PositionId,
    /// Traded symbol.
    pub symbol: String,
    /// Owning account.
    pub account_id: AccountId,
    /// Exchange the position lives on.
    pub exchange: ExchangeId,
    /// Direction of the position (`Buy` = long).
    pub side: OrderSide,
    /// Entry price (synthetic for adopted positions).
    pub entry_price: Decimal,
    /// Quantity in base units.
    pub quantity: Decimal,
    /// Position size in quote currency at entry.
    pub size_in_quote_currency: Decimal,
    /// When the position was opened or adopted.
    pub opened_at: DateTime<Utc>,
    /// Provenance.
    pub source: PositionSource,
    /// Entry order that opened this position, when known.
    pub entry_order_id: Option<OrderId>,
}

impl Position {
    /// Create a strategy-opened position from a confirmed entry fill.
    #[must_use]
    pub fn opened(
        account_id: AccountId,
        exchange: ExchangeId,
        symbol: impl Into<String>,
        side: OrderSide,
        entry_price: Decimal,
        quantity: Decimal,
        entry_order_id: OrderId,
    ) -> Self {
        Self {
            position_id: PositionId::generate(),
            symbol: symbol.into(),
            account_id,
            exchange,
            side,
            entry_price,
            quantity,
            size_in_quote_currency: entry_price * quantity,
            opened_at: Utc::now(),
            source: PositionSource::StrategyOpened,
            entry_order_id: Some(entry_order_id),
        }
    }

    /// Create an adopted position from exchange-reported state.
    ///
    /// `mark_price` is the current market price; it becomes the synthetic
    /// entry so P&L starts at zero.
    #[must_use]
    pub fn adopted(
        account_id: AccountId,
        exchange: ExchangeId,
        symbol: impl Into<String>,
        side: OrderSide,
        mark_price: Decimal,
        quantity: Decimal,
    ) -> Self {
        Self {
            position_id: PositionId::generate(),
            symbol: symbol.into(),
            account_id,
            exchange,
            side,
            entry_price: mark_price,
            quantity,
            size_in_quote_currency: mark_price * quantity,
            opened_at: Utc::now(),
            source: PositionSource::Adopted,
            entry_order_id: None,
        }
    }
}

/// A symbol quarantined after failed price/metadata lookup.
///
/// Persisted so repeated reconciliation runs do not re-fail the same
/// unsupported symbol every cycle. Removed only by operator action or a
/// later successful lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZombieAsset {
    /// The quarantined symbol.
    pub symbol: String,
    /// Why the lookup failed.
    pub reason: String,
    /// When the symbol was quarantined.
    pub quarantined_at: DateTime<Utc>,
}

impl ZombieAsset {
    /// Quarantine `symbol` now for `reason`.
    #[must_use]
    pub fn new(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            reason: reason.into(),
            quarantined_at: Utc::now(),
        }
    }
}
