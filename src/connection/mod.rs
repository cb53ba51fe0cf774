pub mod backoff;
pub mod monitor;

pub use backoff::Backoff;
pub use monitor::{ConnectionMonitor, ConnectionState, HostSignal, Subscription};
