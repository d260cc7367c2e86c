//! Durable, out-of-process-visible emergency flag.
//!
//! The kill switch is a JSON marker file. Any process (or operator with a
//! shell) can create it to force the engine into EMERGENCY_STOP on its next
//! state check; the engine keeps honoring it until the file is removed
//! through [`KillSwitch::deactivate`] with a recorded reason.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::StateError;

/// Marker payload written when the switch is thrown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchMarker {
    /// When the switch was activated.
    pub activated_at: DateTime<Utc>,
    /// Operator-supplied reason.
    pub reason: String,
}

/// File-backed emergency kill switch.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    path: PathBuf,
}

impl KillSwitch {
    /// Create a switch backed by the marker file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the marker file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the switch is currently thrown.
    ///
    /// The file's existence is the flag: an unreadable or corrupt marker
    /// still counts as active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.path.exists()
    }

    /// Read the marker payload, if the switch is active and readable.
    #[must_use]
    pub fn marker(&self) -> Option<KillSwitchMarker> {
        let bytes = std::fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Throw the switch with a mandatory reason.
    pub fn activate(&self, reason: &str) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(StateError::from_io(&self.path))?;
        }
        let marker = KillSwitchMarker {
            activated_at: Utc::now(),
            reason: reason.to_string(),
        };
        let bytes = serde_json::to_vec_pretty(&marker)
            .map_err(|e| StateError::Marker(e.to_string()))?;
        std::fs::write(&self.path, bytes).map_err(StateError::from_io(&self.path))?;
        error!(path = %self.path.display(), reason, "KILL SWITCH ACTIVATED");
        Ok(())
    }

    /// Clear the switch with a mandatory reason.
    ///
    /// Fails when the switch is not active so a typo'd path cannot look
    /// like a successful deactivation.
    pub fn deactivate(&self, reason: &str) -> Result<(), StateError> {
        if !self.is_active() {
            warn!(path = %self.path.display(), "Deactivation requested but kill switch is not active");
            return Err(StateError::KillSwitchNotActive);
        }
        std::fs::remove_file(&self.path).map_err(StateError::from_io(&self.path))?;
        info!(path = %self.path.display(), reason, "Kill switch deactivated");
        Ok(())
    }
}
