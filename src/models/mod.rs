pub mod message;
pub mod session;
pub mod task;

pub use message::{Envelope, Priority};
pub use session::{
    ActiveSession, NewWorkSession, SessionPatch, SessionStatus, TimerMode, WorkSession,
};
pub use task::Task;
