//! Typed publish/subscribe channel for state changes that other components or
//! UI bridges react to.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::{
    connection::ConnectionState,
    delivery::RecoveryPhase,
    models::SessionStatus,
    session::TimerState,
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SyncEvent {
    TimerStateChanged {
        state: TimerState,
    },
    #[serde(rename_all = "camelCase")]
    TimerHeartbeat {
        remaining_secs: u32,
        session_id: Option<String>,
    },
    /// The confirmed focus minutes of a task changed.
    #[serde(rename_all = "camelCase")]
    DeepFocusTimeUpdated {
        task_id: String,
        total_minutes: u32,
    },
    #[serde(rename_all = "camelCase")]
    SessionOpened {
        session_id: String,
        task_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SessionClosed {
        session_id: String,
        status: SessionStatus,
    },
    SyncErrorRaised {
        message: String,
    },
    ConnectionChanged {
        state: ConnectionState,
    },
    RecoveryPhaseChanged {
        phase: RecoveryPhase,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}
