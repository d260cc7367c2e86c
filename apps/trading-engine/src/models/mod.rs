//! Core data types shared across the engine.

mod account;
mod order;
mod position;

pub use account::{Account, AccountId, AccountRole, ExchangeId, OrderId, PositionId};
pub use order::{Fill, Order, OrderSide, OrderStatus};
pub use position::{Position, PositionSource, ZombieAsset};
