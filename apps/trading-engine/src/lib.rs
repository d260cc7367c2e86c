// Allow unwrap/expect in tests - tests should panic on unexpected errors
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Trading Engine - Armada Core Library
//!
//! Multi-account, multi-exchange execution core for the Armada trading
//! system. The engine turns abstract strategy intents ("open this much size
//! in this direction", "close this position") into safely-ordered,
//! capital-aware, crash-recoverable exchange operations.
//!
//! # Architecture
//!
//! Dependency order, leaves first:
//!
//! - `sequencer`: process-wide monotonic request-sequence generator with a
//!   durable checkpoint, startup burst limiting, and the exchange call lock
//! - `ledger`: per-account order, reservation, and position tracking with
//!   integrity checks (double reservation, fragmentation, stale orders)
//! - `state`: trading-wide state machine with a durable kill switch
//! - `reconcile`: startup/on-demand adoption of exchange-reported positions
//!   and quarantine of zombie assets
//! - `gateway`: serialized, validated order placement with slippage
//!   rejection and automatic unwind of bad fills
//! - `enforcer`: independently scheduled loop re-asserting position caps and
//!   forced-liquidation policy
//! - `orchestrator`: one supervised execution task per (account, exchange)
//!   pair, isolated from its siblings
//!
//! The exchange boundary is the `exchange::ExchangeAdapter` capability trait;
//! transport, signing, and indicator math live behind it and are out of
//! scope here.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

/// Configuration loading and per-component settings.
pub mod config;

/// Background enforcement of position caps and forced unwind.
pub mod enforcer;

/// Exchange capability boundary: adapter trait, retry policy, paper venue.
pub mod exchange;

/// Order placement and cancellation gateway.
pub mod gateway;

/// Per-account order, reservation, and position ledger.
pub mod ledger;

/// Core data types: accounts, orders, positions.
pub mod models;

/// Supervision of per-(account, exchange) execution tasks.
pub mod orchestrator;

/// Durable state: checkpoints, blacklist, ledger snapshots.
pub mod persistence;

/// Position adoption and zombie-asset quarantine.
pub mod reconcile;

/// Monotonic request-sequence generation and the exchange call lock.
pub mod sequencer;

/// Trading state machine and kill switch.
pub mod state;

/// Strategy intent boundary consumed by the orchestrator.
pub mod strategy;

/// Tracing subscriber initialization.
pub mod telemetry;

pub use config::Config;
pub use enforcer::ExitEnforcer;
pub use exchange::{ExchangeAdapter, ExchangeError, PaperExchange, RetryPolicy};
pub use gateway::{ExecutionGateway, SubmitError};
pub use ledger::{AccountLedger, AccountStats};
pub use models::{
    AccountId, ExchangeId, Fill, Order, OrderSide, OrderStatus, Position, PositionSource,
    ZombieAsset,
};
pub use orchestrator::AccountOrchestrator;
pub use reconcile::{OrphanOrder, PositionReconciler, ReconciliationReport, ZombieBlacklist};
pub use sequencer::SequenceGenerator;
pub use state::{KillSwitch, TradingState, TradingStateMachine};
pub use strategy::{Intent, Strategy};
