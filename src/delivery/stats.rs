use serde::Serialize;

use super::RecoveryPhase;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub retried: u64,
    pub queue_depth: usize,
    pub recovery_phase: RecoveryPhase,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Counters {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub retried: u64,
}
