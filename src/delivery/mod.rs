//! At-least-once delivery of outbound messages to the background context.

pub mod chunking;
pub mod queue;
pub mod recovery;
pub mod stats;

pub use chunking::{split_into_frames, AssemblyError, ChunkAssembler};
pub use queue::{DeliveryTicket, EnqueueOptions, MessageDeliveryQueue};
pub use recovery::{RecoveryPhase, RecoveryState};
pub use stats::QueueStats;
