//! In-process stand-ins for the host runtime and the remote session store.
//!
//! [`LoopbackHost`] plays the background context: it answers pings, reassembles
//! chunked messages and hands every delivered message to a [`MessageHandler`].
//! [`MemorySessionStore`] keeps session rows in a map and can be told to fail.
//! Both are used by the test suites and by hosts that run the timer offline.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::Utc;
use serde_json::{json, Value};

use crate::{
    delivery::ChunkAssembler,
    error::{SyncError, TransportError},
    models::{NewWorkSession, SessionPatch, SessionStatus, WorkSession},
    runtime::{
        protocol::{
            message_kind, ChunkComplete, ChunkFrame, PingReply, Reply, CHUNKED_MESSAGE,
            CHUNKED_MESSAGE_COMPLETE, PING,
        },
        BoxFuture, RuntimeHost,
    },
    session::{
        store::{
            CreatedSession, IncrementDurationRequest, UpdateSessionRequest, CREATE_SESSION,
            INCREMENT_DURATION, UPDATE_SESSION,
        },
        RemoteSessionStore,
    },
};

const ENABLE_LOGS: bool = false;

use crate::{log_debug, log_warn};

const UNREACHABLE: &str = "Could not establish connection. Receiving end does not exist.";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Receiver side of the loopback: turns one delivered message into a reply.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &Value) -> Reply;
}

struct HostState {
    online: bool,
    send_failures: VecDeque<TransportError>,
    ping_failures: u32,
    latency: Duration,
    sent: Vec<Value>,
    pings: usize,
    assembler: ChunkAssembler,
}

pub struct LoopbackHost {
    state: Mutex<HostState>,
    handler: Option<Arc<dyn MessageHandler>>,
}

impl LoopbackHost {
    /// Replies to every message with its own payload.
    pub fn echo() -> Self {
        Self::build(None)
    }

    pub fn with_handler<H>(handler: Arc<H>) -> Self
    where
        H: MessageHandler + 'static,
    {
        Self::build(Some(handler))
    }

    fn build(handler: Option<Arc<dyn MessageHandler>>) -> Self {
        Self {
            state: Mutex::new(HostState {
                online: true,
                send_failures: VecDeque::new(),
                ping_failures: 0,
                latency: Duration::ZERO,
                sent: Vec::new(),
                pings: 0,
                assembler: ChunkAssembler::default(),
            }),
            handler,
        }
    }

    /// Offline simulates a torn-down background context.
    pub fn set_online(&self, online: bool) {
        lock(&self.state).online = online;
    }

    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = latency;
    }

    /// The next `count` non-ping posts fail with `text` before reaching the receiver.
    pub fn fail_next_sends(&self, count: usize, text: &str) {
        let mut state = lock(&self.state);
        for _ in 0..count {
            state
                .send_failures
                .push_back(TransportError::Failed(text.to_string()));
        }
    }

    /// The receiver refuses the next `count` messages as invalid.
    pub fn reject_next_sends(&self, count: usize, text: &str) {
        let mut state = lock(&self.state);
        for _ in 0..count {
            state
                .send_failures
                .push_back(TransportError::Rejected(text.to_string()));
        }
    }

    pub fn fail_pings(&self, count: u32) {
        lock(&self.state).ping_failures += count;
    }

    /// Every message that reached the receiver, chunked ones reassembled.
    pub fn sent(&self) -> Vec<Value> {
        lock(&self.state).sent.clone()
    }

    pub fn sent_of_kind(&self, kind: &str) -> Vec<Value> {
        lock(&self.state)
            .sent
            .iter()
            .filter(|message| message_kind(message) == Some(kind))
            .cloned()
            .collect()
    }

    pub fn ping_count(&self) -> usize {
        lock(&self.state).pings
    }

    fn deliver(&self, message: Value) -> Result<Value, TransportError> {
        let kind = message_kind(&message).unwrap_or_default().to_string();

        if kind == PING {
            let mut state = lock(&self.state);
            state.pings += 1;
            if !state.online {
                return Err(TransportError::Failed(UNREACHABLE.to_string()));
            }
            if state.ping_failures > 0 {
                state.ping_failures -= 1;
                return Err(TransportError::Failed("ping timed out".to_string()));
            }
            return encode(&PingReply::alive());
        }

        let message = {
            let mut state = lock(&self.state);
            if !state.online {
                return Err(TransportError::Failed(UNREACHABLE.to_string()));
            }
            match state.send_failures.pop_front() {
                Some(TransportError::Rejected(text)) => {
                    state.sent.push(message);
                    return encode(&Reply::failed(text, false));
                }
                Some(err) => return Err(err),
                None => {}
            }

            match kind.as_str() {
                CHUNKED_MESSAGE => {
                    let frame: ChunkFrame = decode(message)?;
                    return match state.assembler.accept(frame) {
                        Ok(()) => encode(&Reply::ok(Value::Null)),
                        Err(err) => encode(&Reply::failed(err.to_string(), false)),
                    };
                }
                CHUNKED_MESSAGE_COMPLETE => {
                    let complete: ChunkComplete = decode(message)?;
                    match state.assembler.complete(complete.message_id) {
                        Ok(message) => message,
                        Err(err) => return encode(&Reply::failed(err.to_string(), false)),
                    }
                }
                _ => message,
            }
        };

        log_debug!("Loopback received {}", message_kind(&message).unwrap_or("?"));
        lock(&self.state).sent.push(message.clone());

        let reply = match &self.handler {
            Some(handler) => handler.handle(&message),
            None => Reply::ok(message.get("payload").cloned().unwrap_or(Value::Null)),
        };
        encode(&reply)
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value, TransportError> {
    serde_json::to_value(value).map_err(|err| TransportError::Failed(err.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(message: Value) -> Result<T, TransportError> {
    serde_json::from_value(message).map_err(|err| TransportError::Rejected(err.to_string()))
}

impl RuntimeHost for LoopbackHost {
    fn messaging_available(&self) -> bool {
        true
    }

    fn process_id(&self) -> Option<String> {
        lock(&self.state).online.then(|| "loopback".to_string())
    }

    fn resource_url(&self, path: &str) -> Option<String> {
        Some(format!("chrome-extension://loopback/{path}"))
    }

    fn post(&self, message: Value) -> BoxFuture<'_, Result<Value, TransportError>> {
        let latency = lock(&self.state).latency;
        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            self.deliver(message)
        })
    }
}

/// How an injected store failure presents itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Store briefly unavailable; callers should retry.
    Transient,
    /// Fails with host text that marks the background context as gone.
    ContextLost,
    /// Refused as invalid; never retried.
    Rejected,
}

impl FailureMode {
    fn into_error(self, kind: &str) -> SyncError {
        match self {
            FailureMode::Transient => SyncError::Transient(format!("{kind} temporarily unavailable")),
            FailureMode::ContextLost => {
                SyncError::ContextLost("Extension context invalidated.".to_string())
            }
            FailureMode::Rejected => SyncError::Validation(format!("{kind} refused")),
        }
    }

    fn into_reply(self, kind: &str) -> Reply {
        match self {
            FailureMode::Transient => Reply::failed(format!("{kind} temporarily unavailable"), true),
            FailureMode::ContextLost => Reply::failed("Extension context invalidated.", true),
            FailureMode::Rejected => Reply::failed(format!("{kind} refused"), false),
        }
    }
}

/// One operation the store applied, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Create { session_id: String, task_id: String },
    Update { session_id: String, status: SessionStatus },
    Increment { session_id: String, minutes: u32 },
}

impl StoreCall {
    pub fn session_id(&self) -> &str {
        match self {
            StoreCall::Create { session_id, .. }
            | StoreCall::Update { session_id, .. }
            | StoreCall::Increment { session_id, .. } => session_id,
        }
    }
}

#[derive(Default)]
struct StoreState {
    sessions: HashMap<String, WorkSession>,
    creates: Vec<NewWorkSession>,
    calls: Vec<StoreCall>,
    failures: HashMap<String, (usize, FailureMode)>,
    next_id: u64,
    latency: Duration,
}

impl StoreState {
    fn take_failure(&mut self, kind: &str) -> Option<FailureMode> {
        let (remaining, mode) = self.failures.get_mut(kind)?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(*mode)
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    state: Mutex<StoreState>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` operations of `kind` (`createSession`, ...).
    pub fn fail_next(&self, kind: &str, count: usize, mode: FailureMode) {
        lock(&self.state)
            .failures
            .insert(kind.to_string(), (count, mode));
    }

    /// Delay every direct store call by `latency`. The change is applied first.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = latency;
    }

    pub fn session(&self, session_id: &str) -> Option<WorkSession> {
        lock(&self.state).sessions.get(session_id).cloned()
    }

    pub fn sessions(&self) -> Vec<WorkSession> {
        let mut sessions: Vec<WorkSession> = lock(&self.state).sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Accepted create requests.
    pub fn create_calls(&self) -> Vec<NewWorkSession> {
        lock(&self.state).creates.clone()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        lock(&self.state).calls.clone()
    }

    pub fn increments_for(&self, session_id: &str) -> Vec<u32> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                StoreCall::Increment {
                    session_id: id,
                    minutes,
                } if id == session_id => Some(*minutes),
                _ => None,
            })
            .collect()
    }

    pub fn updates_for(&self, session_id: &str) -> Vec<SessionStatus> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                StoreCall::Update {
                    session_id: id,
                    status,
                } if id == session_id => Some(*status),
                _ => None,
            })
            .collect()
    }

    fn apply_create(&self, request: NewWorkSession) -> Result<String, SyncError> {
        let mut state = lock(&self.state);
        if let Some(mode) = state.take_failure(CREATE_SESSION) {
            return Err(mode.into_error(CREATE_SESSION));
        }
        let (Some(user_id), Some(task_id)) = (request.user_id.clone(), request.task_id.clone())
        else {
            return Err(SyncError::Validation(
                "userId and taskId are required".into(),
            ));
        };

        state.next_id += 1;
        let session_id = format!("session-{}", state.next_id);
        state.sessions.insert(
            session_id.clone(),
            WorkSession {
                id: session_id.clone(),
                user_id,
                task_id: task_id.clone(),
                project_id: request.project_id.clone(),
                duration: 0,
                session_type: request.session_type,
                status: SessionStatus::Active,
                start_time: request.start_time,
                end_time: None,
                date: request.date,
            },
        );
        state.calls.push(StoreCall::Create {
            session_id: session_id.clone(),
            task_id,
        });
        state.creates.push(request);
        Ok(session_id)
    }

    fn apply_update(&self, session_id: &str, patch: SessionPatch) -> Result<(), SyncError> {
        let mut state = lock(&self.state);
        if let Some(mode) = state.take_failure(UPDATE_SESSION) {
            return Err(mode.into_error(UPDATE_SESSION));
        }
        let Some(row) = state.sessions.get_mut(session_id) else {
            return Err(SyncError::Validation(format!("unknown session {session_id}")));
        };
        row.status = patch.status;
        if patch.status.is_closed() {
            row.end_time = patch.end_time.or_else(|| Some(Utc::now()));
        }
        state.calls.push(StoreCall::Update {
            session_id: session_id.to_string(),
            status: patch.status,
        });
        Ok(())
    }

    fn apply_increment(&self, session_id: &str, minutes: u32) -> Result<(), SyncError> {
        let mut state = lock(&self.state);
        if let Some(mode) = state.take_failure(INCREMENT_DURATION) {
            return Err(mode.into_error(INCREMENT_DURATION));
        }
        if minutes == 0 {
            return Err(SyncError::Validation("minutes must be positive".into()));
        }
        let Some(row) = state.sessions.get_mut(session_id) else {
            return Err(SyncError::Validation(format!("unknown session {session_id}")));
        };
        row.duration += minutes;
        state.calls.push(StoreCall::Increment {
            session_id: session_id.to_string(),
            minutes,
        });
        Ok(())
    }

    fn settle<T: Send + 'static>(&self, result: Result<T, SyncError>) -> BoxFuture<'static, Result<T, SyncError>> {
        let latency = lock(&self.state).latency;
        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            result
        })
    }
}

fn reply_for<T: serde::Serialize>(result: Result<T, SyncError>) -> Reply {
    match result {
        Ok(data) => match serde_json::to_value(data) {
            Ok(data) => Reply::ok(data),
            Err(err) => Reply::failed(err.to_string(), false),
        },
        Err(err) => Reply::failed(err.to_string(), err.is_retryable()),
    }
}

impl MessageHandler for MemorySessionStore {
    fn handle(&self, message: &Value) -> Reply {
        let kind = message_kind(message).unwrap_or_default();
        let payload = message.get("payload").cloned().unwrap_or(Value::Null);

        // Injected failures for the wire path are reported as host replies so
        // the delivery queue classifies them itself.
        if let Some(mode) = lock(&self.state).take_failure(kind) {
            return mode.into_reply(kind);
        }

        match kind {
            CREATE_SESSION => match serde_json::from_value::<NewWorkSession>(payload) {
                Ok(request) => reply_for(
                    self.apply_create(request)
                        .map(|session_id| CreatedSession { session_id }),
                ),
                Err(err) => Reply::failed(format!("malformed createSession: {err}"), false),
            },
            UPDATE_SESSION => match serde_json::from_value::<UpdateSessionRequest>(payload) {
                Ok(request) => reply_for(
                    self.apply_update(&request.session_id, request.patch)
                        .map(|()| json!({})),
                ),
                Err(err) => Reply::failed(format!("malformed updateSession: {err}"), false),
            },
            INCREMENT_DURATION => match serde_json::from_value::<IncrementDurationRequest>(payload)
            {
                Ok(request) => reply_for(
                    self.apply_increment(&request.session_id, request.minutes)
                        .map(|()| json!({})),
                ),
                Err(err) => Reply::failed(format!("malformed incrementDuration: {err}"), false),
            },
            other => {
                log_warn!("Session store ignoring unknown message type {}", other);
                Reply::failed(format!("unknown message type {other}"), false)
            }
        }
    }
}

impl RemoteSessionStore for MemorySessionStore {
    fn create_session(&self, request: NewWorkSession) -> BoxFuture<'static, Result<String, SyncError>> {
        let result = self.apply_create(request);
        self.settle(result)
    }

    fn update_session(
        &self,
        session_id: String,
        patch: SessionPatch,
    ) -> BoxFuture<'static, Result<(), SyncError>> {
        let result = self.apply_update(&session_id, patch);
        self.settle(result)
    }

    fn increment_duration(
        &self,
        session_id: String,
        minutes: u32,
    ) -> BoxFuture<'static, Result<(), SyncError>> {
        let result = self.apply_increment(&session_id, minutes);
        self.settle(result)
    }
}
