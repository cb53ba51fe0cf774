use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryPhase {
    Healthy,
    Recovering,
    /// Terminal until an explicit reset.
    Failed,
}

impl Default for RecoveryPhase {
    fn default() -> Self {
        RecoveryPhase::Healthy
    }
}

/// Queue-wide context-loss tracking, independent of per-message attempt counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryState {
    pub phase: RecoveryPhase,
    pub attempts: u32,
    pub last_attempt_time: Option<DateTime<Utc>>,
}

impl RecoveryState {
    /// Enter RECOVERING. Returns `false` if not currently HEALTHY, in which case
    /// the caller must not run its own recovery procedure.
    pub fn begin(&mut self) -> bool {
        if self.phase != RecoveryPhase::Healthy {
            return false;
        }
        self.phase = RecoveryPhase::Recovering;
        self.attempts = 0;
        true
    }

    pub fn record_attempt(&mut self, at: DateTime<Utc>) {
        self.attempts += 1;
        self.last_attempt_time = Some(at);
    }

    pub fn succeed(&mut self) {
        self.phase = RecoveryPhase::Healthy;
        self.attempts = 0;
    }

    pub fn fail(&mut self) {
        self.phase = RecoveryPhase::Failed;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
