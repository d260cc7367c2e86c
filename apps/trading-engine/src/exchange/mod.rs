//! Exchange capability boundary.
//!
//! Transport and signing are out of scope for the engine; everything it
//! needs from a venue is the small capability contract in
//! [`ExchangeAdapter`]. One conforming adapter exists per exchange, and the
//! core is polymorphic over the trait, never over exchange-specific types.
//!
//! The error taxonomy matters more than the happy path: transient transport
//! problems are retryable at this boundary (see [`retry`]), while
//! authentication/ordering rejections are fatal for that single call and
//! must never be retried with the same sequence value.

mod paper;
pub mod retry;

pub use paper::PaperExchange;
pub use retry::{BackoffSchedule, RetryPolicy, with_retry};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{AccountId, OrderSide};

/// Errors surfaced by exchange adapters.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Network/transport failure. Retryable.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Call exceeded its deadline. Retryable.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Venue rate limit. Retryable after backoff.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Authentication failure. Fatal for this call.
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// The venue rejected the request's sequence value as stale. Fatal for
    /// this call; the sequence must never be reused.
    #[error("Sequence {sequence} rejected as stale")]
    SequenceRejected {
        /// The rejected sequence value.
        sequence: u64,
    },

    /// Price or metadata lookup failed for the symbol.
    #[error("Price unavailable for {0}")]
    PriceUnavailable(String),

    /// Symbol not supported by the venue.
    #[error("Unsupported symbol {0}")]
    UnsupportedSymbol(String),

    /// Order rejected by the venue.
    #[error("Order rejected: {0}")]
    Rejected(String),

    /// Referenced order does not exist on the venue.
    #[error("Order not found: {0}")]
    OrderNotFound(String),
}

impl ExchangeError {
    /// Whether retrying the same logical operation can help.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::RateLimited(_)
        )
    }
}

/// Raw response from a signed venue call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawResponse {
    /// HTTP-like status code.
    pub status: u16,
    /// Venue payload.
    pub body: serde_json::Value,
}

/// Order as reported by the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOrder {
    /// Venue order id.
    pub order_id: String,
    /// Traded symbol.
    pub symbol: String,
    /// Order side.
    pub side: OrderSide,
    /// Resting price, when known.
    pub price: Option<Decimal>,
    /// Remaining quantity.
    pub quantity: Decimal,
    /// Venue creation time.
    pub created_at: DateTime<Utc>,
}

/// Position as reported by the venue.
///
/// Fields are optional because venues genuinely omit them; the reconciler
/// turns each missing field into an explicit failure reason instead of
/// guessing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPosition {
    /// Traded symbol.
    pub symbol: String,
    /// Direction, `Buy` = long.
    pub side: OrderSide,
    /// Position quantity in base units.
    pub quantity: Option<Decimal>,
    /// Venue-reported entry price, when available.
    pub entry_price: Option<Decimal>,
}

/// Order payload the gateway serializes into `sign_and_send` bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireOrder {
    /// Owning account.
    pub account: AccountId,
    /// Traded symbol.
    pub symbol: String,
    /// Order side.
    pub side: OrderSide,
    /// Quantity in base units.
    pub quantity: Decimal,
}

/// Fill payload parsed out of `sign_and_send` responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFill {
    /// Venue order id.
    pub order_id: String,
    /// Traded symbol.
    pub symbol: String,
    /// Side of the filled order.
    pub side: OrderSide,
    /// Realized price.
    pub price: Decimal,
    /// Filled quantity.
    pub quantity: Decimal,
}

/// Capability contract every exchange adapter implements.
///
/// Adapters own transport, signing, and per-venue quirks. They are expected
/// to apply their own timeouts so no call here blocks indefinitely.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Venue name for logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Whether this venue's authentication requires one global sequence
    /// scope per credential (as opposed to per-connection ordering). When
    /// true, callers must hold the exchange call lock around
    /// `sign_and_send`.
    fn shares_sequence_scope(&self) -> bool;

    /// Build, sign, and send one request carrying `sequence`.
    async fn sign_and_send(
        &self,
        method: &str,
        path: &str,
        body: &serde_json::Value,
        sequence: u64,
    ) -> Result<RawResponse, ExchangeError>;

    /// Open orders for `account` as the venue sees them.
    async fn get_open_orders(&self, account: &AccountId) -> Result<Vec<RawOrder>, ExchangeError>;

    /// Positions for `account` as the venue sees them.
    async fn get_positions(&self, account: &AccountId) -> Result<Vec<RawPosition>, ExchangeError>;

    /// Current price for `symbol`.
    async fn get_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Cancel a venue order. `Ok(false)` means the venue no longer knows
    /// the order (already terminal).
    async fn cancel_order(&self, order_id: &str) -> Result<bool, ExchangeError>;

    /// Available balance for `account` in quote currency.
    async fn get_balance(&self, account: &AccountId) -> Result<Decimal, ExchangeError>;
}
