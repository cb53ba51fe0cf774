//! Boundary to the host messaging runtime.
//!
//! The host (an extension bridge, a native-messaging pipe, or the in-process
//! [`crate::memory::LoopbackHost`]) implements [`RuntimeHost`]. Everything above
//! this module talks to it only through [`MessageChannel`].

pub mod channel;
pub mod context;
pub mod protocol;

use std::{future::Future, pin::Pin};

use crate::error::TransportError;

pub use channel::MessageChannel;
pub use context::{ContextStatus, ContextValidator};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait RuntimeHost: Send + Sync {
    /// Whether the host messaging API exists in this context at all.
    fn messaging_available(&self) -> bool;

    /// Identifier of the live peer process, if one can be obtained.
    fn process_id(&self) -> Option<String>;

    /// Resolve an internal resource path to a URL.
    fn resource_url(&self, path: &str) -> Option<String>;

    /// Post one message to the peer context and wait for its reply.
    ///
    /// Callers bound this with a timeout; the host does not need to.
    fn post(
        &self,
        message: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value, TransportError>>;
}
