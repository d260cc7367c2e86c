//! Trading-wide state machine with an emergency kill switch.
//!
//! One process-wide [`TradingState`] gates whether entries may be placed.
//! Every transition carries a mandatory human-readable reason and lands in
//! the transition log. Two rules are load-bearing:
//!
//! - The machine never auto-transitions into LIVE_ACTIVE. The only way in
//!   is an explicit, separately-logged [`TradingStateMachine::confirm_live`]
//!   from LIVE_PENDING_CONFIRMATION.
//! - EMERGENCY_STOP dominates. While the kill-switch marker exists, every
//!   state check forces EMERGENCY_STOP, and the only way back out is
//!   [`TradingStateMachine::restore_safe_mode`], which refuses while the
//!   switch is still thrown and lands in DRY_RUN, never live.

mod kill_switch;

pub use kill_switch::{KillSwitch, KillSwitchMarker};

use std::path::Path;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

/// Process-wide trading state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradingState {
    /// Nothing runs.
    Off,
    /// Full decision cycles against paper venues; no live orders.
    DryRun,
    /// Live trading requested, awaiting human confirmation.
    LivePendingConfirmation,
    /// Live orders flowing.
    LiveActive,
    /// Halted by the kill switch or an operator.
    EmergencyStop,
}

impl std::fmt::Display for TradingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Off => "OFF",
            Self::DryRun => "DRY_RUN",
            Self::LivePendingConfirmation => "LIVE_PENDING_CONFIRMATION",
            Self::LiveActive => "LIVE_ACTIVE",
            Self::EmergencyStop => "EMERGENCY_STOP",
        };
        write!(f, "{s}")
    }
}

/// One entry in the transition log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// State before.
    pub from: TradingState,
    /// State after.
    pub to: TradingState,
    /// Operator- or system-supplied reason.
    pub reason: String,
    /// When the transition happened.
    pub at: DateTime<Utc>,
}

/// Errors from state machine operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// The requested edge does not exist.
    #[error("Invalid transition {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: TradingState,
        /// Requested state.
        to: TradingState,
    },

    /// LIVE_ACTIVE can only be entered through `confirm_live`.
    #[error("LIVE_ACTIVE requires explicit confirmation from LIVE_PENDING_CONFIRMATION")]
    ConfirmationRequired,

    /// The kill switch is still thrown.
    #[error("Kill switch is active; deactivate it before restoring")]
    KillSwitchActive,

    /// Deactivation requested while the switch was not thrown.
    #[error("Kill switch is not active")]
    KillSwitchNotActive,

    /// Marker file I/O failed.
    #[error("Kill switch marker I/O failed at '{path}': {source}")]
    Io {
        /// Marker path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Marker payload could not be encoded.
    #[error("Kill switch marker encoding failed: {0}")]
    Marker(String),
}

impl StateError {
    pub(crate) fn from_io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// The trading-wide state machine.
pub struct TradingStateMachine {
    current: RwLock<TradingState>,
    log: Mutex<Vec<TransitionRecord>>,
    kill_switch: KillSwitch,
}

impl TradingStateMachine {
    /// Create a machine in OFF, honoring an already-thrown kill switch.
    #[must_use]
    pub fn new(kill_switch: KillSwitch) -> Self {
        let machine = Self {
            current: RwLock::new(TradingState::Off),
            log: Mutex::new(Vec::new()),
            kill_switch,
        };
        // An inherited marker halts us before the first cycle runs.
        let _ = machine.current_state();
        machine
    }

    /// The kill switch this machine answers to.
    #[must_use]
    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    /// Current state, after honoring the kill switch.
    ///
    /// If the marker file exists and the machine is not already halted,
    /// this check itself performs the forced transition to EMERGENCY_STOP.
    pub fn current_state(&self) -> TradingState {
        if self.kill_switch.is_active() && self.read_state() != TradingState::EmergencyStop {
            let reason = self
                .kill_switch
                .marker()
                .map_or_else(|| "kill switch marker present".to_string(), |m| m.reason);
            self.force(TradingState::EmergencyStop, &reason);
        }
        self.read_state()
    }

    /// Whether entries may currently be placed.
    #[must_use]
    pub fn is_trading_allowed(&self) -> bool {
        matches!(
            self.current_state(),
            TradingState::DryRun | TradingState::LiveActive
        )
    }

    /// Request a transition along a sanctioned edge.
    ///
    /// LIVE_ACTIVE is rejected here unconditionally (`confirm_live` is the
    /// only way in), and EMERGENCY_STOP is only left via
    /// `restore_safe_mode`.
    pub fn request_transition(
        &self,
        target: TradingState,
        reason: &str,
    ) -> Result<TradingState, StateError> {
        if target == TradingState::LiveActive {
            return Err(StateError::ConfirmationRequired);
        }
        if target == TradingState::EmergencyStop {
            self.trigger_emergency_stop(reason);
            return Ok(TradingState::EmergencyStop);
        }

        let from = self.current_state();
        let allowed = matches!(
            (from, target),
            (TradingState::Off, TradingState::DryRun)
                | (TradingState::DryRun, TradingState::Off)
                | (TradingState::DryRun, TradingState::LivePendingConfirmation)
                | (TradingState::LivePendingConfirmation, TradingState::DryRun)
                | (TradingState::LivePendingConfirmation, TradingState::Off)
        );
        if !allowed {
            return Err(StateError::InvalidTransition { from, to: target });
        }
        self.force(target, reason);
        Ok(target)
    }

    /// Enter LIVE_ACTIVE from LIVE_PENDING_CONFIRMATION.
    ///
    /// The separately-logged human confirmation step; there is no other
    /// path into live trading.
    pub fn confirm_live(&self, reason: &str) -> Result<(), StateError> {
        let from = self.current_state();
        if from != TradingState::LivePendingConfirmation {
            return Err(StateError::InvalidTransition {
                from,
                to: TradingState::LiveActive,
            });
        }
        warn!(reason, "LIVE trading confirmed by operator");
        self.force(TradingState::LiveActive, reason);
        Ok(())
    }

    /// Force EMERGENCY_STOP from any state.
    pub fn trigger_emergency_stop(&self, reason: &str) {
        if self.read_state() != TradingState::EmergencyStop {
            error!(reason, "EMERGENCY STOP");
            self.force(TradingState::EmergencyStop, reason);
        }
    }

    /// The sole sanctioned path out of EMERGENCY_STOP:
    /// EMERGENCY_STOP -> OFF -> DRY_RUN.
    ///
    /// Fails loudly while the kill switch is still thrown.
    pub fn restore_safe_mode(&self, reason: &str) -> Result<TradingState, StateError> {
        let from = self.current_state();
        if from != TradingState::EmergencyStop {
            return Err(StateError::InvalidTransition {
                from,
                to: TradingState::Off,
            });
        }
        if self.kill_switch.is_active() {
            error!(
                path = %self.kill_switch.path().display(),
                "restore_safe_mode refused: kill switch still active"
            );
            return Err(StateError::KillSwitchActive);
        }
        self.force(TradingState::Off, "restore_safe_mode");
        self.force(TradingState::DryRun, reason);
        Ok(TradingState::DryRun)
    }

    /// Copy of the transition log.
    pub fn transition_log(&self) -> Vec<TransitionRecord> {
        match self.log.lock() {
            Ok(log) => log.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn read_state(&self) -> TradingState {
        match self.current.read() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn force(&self, to: TradingState, reason: &str) {
        let from = {
            let mut current = match self.current.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let from = *current;
            *current = to;
            from
        };
        info!(%from, %to, reason, "Trading state transition");
        let record = TransitionRecord {
            from,
            to,
            reason: reason.to_string(),
            at: Utc::now(),
        };
        match self.log.lock() {
            Ok(mut log) => log.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}
