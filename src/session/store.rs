//! The remote work-session store as the engine sees it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    delivery::{EnqueueOptions, MessageDeliveryQueue},
    error::SyncError,
    models::{NewWorkSession, Priority, SessionPatch},
    runtime::BoxFuture,
};

pub const CREATE_SESSION: &str = "createSession";
pub const UPDATE_SESSION: &str = "updateSession";
pub const INCREMENT_DURATION: &str = "incrementDuration";

/// Implementations start the operation when the method is called; the
/// returned future only waits for its outcome.
pub trait RemoteSessionStore: Send + Sync {
    /// Open a session row and return its id. Missing user or task ids fail
    /// with [`SyncError::Validation`].
    fn create_session(&self, request: NewWorkSession) -> BoxFuture<'static, Result<String, SyncError>>;

    fn update_session(
        &self,
        session_id: String,
        patch: SessionPatch,
    ) -> BoxFuture<'static, Result<(), SyncError>>;

    /// Add `minutes` (a small positive number) to the session's duration.
    fn increment_duration(
        &self,
        session_id: String,
        minutes: u32,
    ) -> BoxFuture<'static, Result<(), SyncError>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSessionRequest {
    pub session_id: String,
    pub patch: SessionPatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IncrementDurationRequest {
    pub session_id: String,
    pub minutes: u32,
}

/// [`RemoteSessionStore`] that travels through the delivery queue.
///
/// Each call enqueues before returning its future, so the delivery order of
/// operations matches the order they were issued in.
#[derive(Clone)]
pub struct QueuedSessionStore {
    queue: MessageDeliveryQueue,
}

impl QueuedSessionStore {
    pub fn new(queue: MessageDeliveryQueue) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &MessageDeliveryQueue {
        &self.queue
    }

    fn submit<T: Serialize>(
        &self,
        kind: &str,
        body: &T,
        priority: Priority,
    ) -> BoxFuture<'static, Result<Value, SyncError>> {
        let payload = match serde_json::to_value(body) {
            Ok(payload) => payload,
            Err(err) => {
                let error = SyncError::Validation(format!("unencodable {kind} request: {err}"));
                return Box::pin(async move { Err(error) });
            }
        };
        let ticket = self
            .queue
            .enqueue(kind, payload, EnqueueOptions::with_priority(priority));
        Box::pin(async move { ticket.await.map_err(SyncError::from) })
    }
}

impl RemoteSessionStore for QueuedSessionStore {
    fn create_session(&self, request: NewWorkSession) -> BoxFuture<'static, Result<String, SyncError>> {
        if request.user_id.is_none() || request.task_id.is_none() {
            return Box::pin(async {
                Err(SyncError::Validation(
                    "userId and taskId are required to create a session".into(),
                ))
            });
        }

        let reply = self.submit(CREATE_SESSION, &request, Priority::High);
        Box::pin(async move {
            let data = reply.await?;
            serde_json::from_value::<CreatedSession>(data)
                .map(|created| created.session_id)
                .map_err(|err| SyncError::Validation(format!("malformed createSession reply: {err}")))
        })
    }

    fn update_session(
        &self,
        session_id: String,
        patch: SessionPatch,
    ) -> BoxFuture<'static, Result<(), SyncError>> {
        let reply = self.submit(
            UPDATE_SESSION,
            &UpdateSessionRequest { session_id, patch },
            Priority::High,
        );
        Box::pin(async move { reply.await.map(|_| ()) })
    }

    fn increment_duration(
        &self,
        session_id: String,
        minutes: u32,
    ) -> BoxFuture<'static, Result<(), SyncError>> {
        let reply = self.submit(
            INCREMENT_DURATION,
            &IncrementDurationRequest {
                session_id,
                minutes,
            },
            Priority::Normal,
        );
        Box::pin(async move { reply.await.map(|_| ()) })
    }
}
