//! Error taxonomy shared by the messaging and session layers.
//!
//! Transport failures are classified once, at the delivery-queue boundary.
//! Only [`DeliveryError`] and [`SyncError`] travel further up.

use std::time::Duration;

use thiserror::Error;

/// Raw failure of a single host round-trip.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Error text reported by the host messaging layer.
    #[error("{0}")]
    Failed(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The receiver understood the message and refused it. Never retried.
    #[error("rejected by receiver: {0}")]
    Rejected(String),

    /// The reply channel was dropped before a response arrived.
    #[error("message port closed before a response was received")]
    Disconnected,
}

/// How the delivery queue treats a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The background context was torn down; handled queue-wide by recovery.
    ContextLost,
    /// Network-ish failure; retried per message with backoff.
    Transient,
    /// Malformed or incomplete request; fails immediately.
    Validation,
}

/// Error text the host produces when the extension context has gone away.
pub const CONTEXT_LOSS_SIGNATURES: &[&str] = &[
    "extension context invalidated",
    "context invalidated",
    "receiving end does not exist",
    "could not establish connection",
    "message port closed",
];

/// Classify a transport failure. `extra_signatures` are matched case-insensitively
/// in addition to [`CONTEXT_LOSS_SIGNATURES`].
pub fn classify_failure(err: &TransportError, extra_signatures: &[String]) -> FailureClass {
    match err {
        TransportError::Rejected(_) => FailureClass::Validation,
        TransportError::Timeout(_) => FailureClass::Transient,
        TransportError::Disconnected => FailureClass::ContextLost,
        TransportError::Failed(text) => {
            if is_context_loss(text, extra_signatures) {
                FailureClass::ContextLost
            } else {
                FailureClass::Transient
            }
        }
    }
}

pub fn is_context_loss(text: &str, extra_signatures: &[String]) -> bool {
    let lowered = text.to_lowercase();
    CONTEXT_LOSS_SIGNATURES
        .iter()
        .any(|signature| lowered.contains(signature))
        || extra_signatures
            .iter()
            .any(|signature| lowered.contains(&signature.to_lowercase()))
}

/// Final outcome of a message the queue could not deliver.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("delivery failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("extension context could not be recovered: {0}")]
    RecoveryExhausted(String),

    #[error("message rejected: {0}")]
    Rejected(String),

    /// The queue is in its terminal FAILED phase.
    #[error("delivery queue has failed; reload required")]
    QueueFailed,

    #[error("delivery queue shut down")]
    Shutdown,

    #[error("payload could not be encoded: {0}")]
    Encoding(String),
}

/// Classified failure of a remote session operation, as seen by the session engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("sync temporarily unavailable: {0}")]
    Transient(String),

    #[error("extension context lost: {0}")]
    ContextLost(String),

    #[error("invalid session request: {0}")]
    Validation(String),

    #[error("session conflict: {0}")]
    Conflict(String),

    #[error("connection could not be recovered: {0}")]
    RecoveryExhausted(String),
}

impl SyncError {
    /// Retryable failures keep a running timer alive in degraded mode.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_) | SyncError::ContextLost(_))
    }

    /// Text suitable for the timer's `sync_error` indicator.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Transient(_) | SyncError::ContextLost(_) => {
                "Changes queued, will retry".to_string()
            }
            SyncError::RecoveryExhausted(_) => {
                "Connection to the extension was lost. Please reload the page.".to_string()
            }
            SyncError::Validation(detail) => format!("Could not sync session: {detail}"),
            SyncError::Conflict(detail) => format!("Timer is active elsewhere: {detail}"),
        }
    }
}

impl From<DeliveryError> for SyncError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::RetriesExhausted { .. } => SyncError::Transient(err.to_string()),
            DeliveryError::RecoveryExhausted(_) | DeliveryError::QueueFailed => {
                SyncError::RecoveryExhausted(err.to_string())
            }
            DeliveryError::Shutdown => SyncError::RecoveryExhausted(err.to_string()),
            DeliveryError::Rejected(detail) | DeliveryError::Encoding(detail) => {
                SyncError::Validation(detail)
            }
        }
    }
}
