//! Timer state and its synchronization with the remote work-session store.

pub mod conflict;
pub mod engine;
pub mod lock;
pub mod retry;
pub mod state;
pub mod store;

pub use conflict::{resolve, RemoteTimerState, Resolution};
pub use engine::{DeviceIdentity, EngineBuilder, SessionSyncEngine};
pub use lock::{StartClaim, StartLockRegistry};
pub use retry::{PendingOp, SyncRetryQueue};
pub use state::{TickReport, TimerState};
pub use store::{QueuedSessionStore, RemoteSessionStore};
