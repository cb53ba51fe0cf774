use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{watch, Mutex as AsyncMutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use uuid::Uuid;

use crate::{
    connection::{ConnectionMonitor, Subscription},
    dates::session_date,
    error::SyncError,
    events::{EventBus, SyncEvent},
    models::{ActiveSession, NewWorkSession, SessionPatch, SessionStatus, Task},
    settings::TimerSettings,
};

use super::{
    conflict::{resolve, RemoteTimerState, Resolution},
    lock::{ClaimState, StartClaim, StartLease, StartLockRegistry},
    retry::{PendingOp, SyncRetryQueue},
    store::RemoteSessionStore,
    TimerState,
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    pub user_id: Option<String>,
}

impl DeviceIdentity {
    pub fn new(device_id: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            device_id: device_id.into(),
            user_id,
        }
    }
}

struct IncrementJob {
    session_id: String,
    task_id: String,
    minutes: u32,
    focus: bool,
}

impl IncrementJob {
    fn into_op(self) -> PendingOp {
        PendingOp::Increment {
            session_id: self.session_id,
            task_id: self.task_id,
            minutes: self.minutes,
            focus: self.focus,
        }
    }
}

/// Where a freshly created session ended up.
enum Opening {
    Opened(TimerState),
    /// Another path opened a session first.
    Duplicate(TimerState),
    /// The selected task moved on while the create was in flight.
    TaskChanged(Option<Task>),
}

struct EngineInner {
    engine_id: String,
    identity: DeviceIdentity,
    settings: TimerSettings,
    store: Arc<dyn RemoteSessionStore>,
    locks: StartLockRegistry,
    events: EventBus,
    state: AsyncMutex<TimerState>,
    lease: Mutex<Option<StartLease>>,
    retry: Mutex<SyncRetryQueue>,
    in_flight: watch::Sender<usize>,
    flushing: AtomicBool,
    ticks: AtomicU32,
    ticker: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<(ConnectionMonitor, Subscription)>>,
}

pub struct EngineBuilder {
    store: Arc<dyn RemoteSessionStore>,
    identity: DeviceIdentity,
    settings: TimerSettings,
    locks: StartLockRegistry,
    events: EventBus,
}

impl EngineBuilder {
    pub fn settings(mut self, settings: TimerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Share a start lock with the other engines (tabs) of this device.
    pub fn locks(mut self, locks: StartLockRegistry) -> Self {
        self.locks = locks;
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> SessionSyncEngine {
        let (in_flight, _) = watch::channel(0);
        SessionSyncEngine {
            inner: Arc::new(EngineInner {
                engine_id: Uuid::new_v4().to_string(),
                state: AsyncMutex::new(TimerState::new(&self.settings)),
                identity: self.identity,
                settings: self.settings,
                store: self.store,
                locks: self.locks,
                events: self.events,
                lease: Mutex::new(None),
                retry: Mutex::new(SyncRetryQueue::new()),
                in_flight,
                flushing: AtomicBool::new(false),
                ticks: AtomicU32::new(0),
                ticker: Mutex::new(None),
                monitor: Mutex::new(None),
            }),
        }
    }
}

/// Owns the timer state of one context and keeps the remote session in step
/// with it. Clones share the same engine.
#[derive(Clone)]
pub struct SessionSyncEngine {
    inner: Arc<EngineInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionSyncEngine {
    pub fn builder(store: Arc<dyn RemoteSessionStore>, identity: DeviceIdentity) -> EngineBuilder {
        EngineBuilder {
            store,
            identity,
            settings: TimerSettings::default(),
            locks: StartLockRegistry::new(),
            events: EventBus::new(),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub async fn snapshot(&self) -> TimerState {
        self.inner.state.lock().await.clone()
    }

    /// Failed session operations waiting to be replayed.
    pub fn pending_sync_count(&self) -> usize {
        lock(&self.inner.retry).len()
    }

    /// Wait until every increment and background close issued so far has
    /// settled, successfully or into the retry queue.
    pub async fn wait_for_pending_syncs(&self) {
        let mut in_flight = self.inner.in_flight.subscribe();
        let _ = in_flight.wait_for(|count| *count == 0).await;
    }

    pub async fn start(&self) -> Result<TimerState, SyncError> {
        let task = {
            let state = self.inner.state.lock().await;
            if state.is_running {
                return Err(SyncError::Conflict("timer is already running".into()));
            }
            if state.active_session.is_some() {
                return Err(SyncError::Conflict(
                    "the previous session is still closing".into(),
                ));
            }
            state
                .current_task
                .clone()
                .ok_or_else(|| SyncError::Validation("select a task before starting".into()))?
        };

        self.open_session(task).await
    }

    pub async fn pause(&self) -> Result<TimerState, SyncError> {
        let (session, owner) = {
            let mut state = self.inner.state.lock().await;
            if !state.is_running {
                return Ok(state.clone());
            }
            state.is_running = false;
            if let Some(session) = state.active_session.as_mut() {
                session.status = SessionStatus::Paused;
                session.last_update_time = Utc::now();
            }
            (
                state.active_session.clone(),
                state.is_active_device_for_this_timer,
            )
        };
        self.emit_state().await;

        let Some(session) = session else {
            return Ok(self.snapshot().await);
        };

        if !owner {
            // Followers only stop mirroring; the owning tab closes the session.
            let snapshot = {
                let mut state = self.inner.state.lock().await;
                state.active_session = None;
                state.clone()
            };
            self.emit_state().await;
            return Ok(snapshot);
        }

        let patch = SessionPatch::closed(SessionStatus::Paused, Utc::now());
        let result = if self.connected() {
            self.inner
                .store
                .update_session(session.session_id.clone(), patch.clone())
                .await
        } else {
            // The delivery queue would hold the close until the host is back.
            Err(SyncError::Transient("host unreachable while pausing".into()))
        };

        let snapshot = {
            let mut state = self.inner.state.lock().await;
            if !state.is_running && state.session_id() == Some(session.session_id.as_str()) {
                state.active_session = None;
            }
            if let Err(err) = &result {
                state.sync_error = Some(err.user_message());
            }
            state.clone()
        };
        self.release_lease();

        let outcome = match result {
            Ok(()) => {
                log_info!("Paused session {}", session.session_id);
                self.inner.events.publish(SyncEvent::SessionClosed {
                    session_id: session.session_id,
                    status: SessionStatus::Paused,
                });
                Ok(snapshot)
            }
            Err(err) => {
                log_warn!(
                    "Session {} is still open remotely: {}",
                    session.session_id,
                    err
                );
                self.inner.events.publish(SyncEvent::SyncErrorRaised {
                    message: err.user_message(),
                });
                match err {
                    SyncError::Validation(_) => Err(err),
                    _ => {
                        lock(&self.inner.retry).push(PendingOp::Close {
                            session_id: session.session_id,
                            patch,
                        });
                        Ok(snapshot)
                    }
                }
            }
        };
        self.emit_state().await;
        outcome
    }

    /// Select the task to focus on. Switching while running closes the current
    /// session as `switched` and opens one for the new task.
    pub async fn set_current_task(&self, task: Option<Task>) -> Result<TimerState, SyncError> {
        let Some(task) = task else {
            self.pause().await?;
            let snapshot = {
                let mut state = self.inner.state.lock().await;
                state.current_task = None;
                state.clone()
            };
            self.emit_state().await;
            return Ok(snapshot);
        };

        let previous = {
            let mut state = self.inner.state.lock().await;
            let same_task = state
                .current_task
                .as_ref()
                .map_or(false, |current| current.id == task.id);

            if same_task {
                if let Some(current) = state.current_task.as_mut() {
                    current.title = task.title;
                    current.project_id = task.project_id;
                }
                return Ok(state.clone());
            }

            if !state.is_running || !state.is_active_device_for_this_timer {
                if state.is_running {
                    log_info!("Stopped following session before switching task");
                    state.is_running = false;
                    state.active_session = None;
                }
                state.current_task = Some(task);
                let snapshot = state.clone();
                drop(state);
                self.emit_state().await;
                return Ok(snapshot);
            }

            // Stopped until the new session opens, so no minute lands on either.
            state.is_running = false;
            state.current_task = Some(task.clone());
            state.active_session.take()
        };
        self.release_lease();

        if let Some(previous) = previous {
            log_info!(
                "Switching from task {} to {}",
                previous.task_id,
                task.id
            );
            self.close_in_background(previous.session_id, SessionStatus::Switched);
        }

        self.open_session(task).await
    }

    /// Advance the running timer by one second.
    pub async fn tick(&self) -> TimerState {
        let (report, snapshot, job) = {
            let mut state = self.inner.state.lock().await;
            if !state.is_running {
                return state.clone();
            }
            let report = state.advance();
            let job = if report.minutes_crossed > 0 && state.is_active_device_for_this_timer {
                state
                    .active_session
                    .as_ref()
                    .map(|session| IncrementJob {
                        session_id: session.session_id.clone(),
                        task_id: session.task_id.clone(),
                        minutes: report.minutes_crossed,
                        focus: state.mode.is_focus(),
                    })
            } else {
                None
            };
            if job.is_some() {
                if let Some(session) = state.active_session.as_mut() {
                    session.last_update_time = Utc::now();
                }
            }
            (report, state.clone(), job)
        };

        if let Some(job) = job {
            self.submit_increment(job);
        }

        let ticks = self.inner.ticks.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if ticks % self.inner.settings.heartbeat_every_ticks.max(1) == 0 {
            self.inner.events.publish(SyncEvent::TimerHeartbeat {
                remaining_secs: snapshot.current_time_remaining,
                session_id: snapshot.session_id().map(str::to_string),
            });
        }

        if report.completed {
            return self.complete().await;
        }

        self.kick_flush();
        snapshot
    }

    /// Start a background replay when something is queued and the host is reachable.
    fn kick_flush(&self) {
        let has_pending = !lock(&self.inner.retry).is_empty();
        if has_pending && self.connected() && !self.inner.flushing.load(Ordering::SeqCst) {
            let engine = self.clone();
            tokio::spawn(async move {
                engine.flush_pending().await;
            });
        }
    }

    /// Replay failed session operations in priority order. Sessions with an
    /// increment still on the wire are left for a later pass. Stops at the
    /// first retryable failure; returns how many operations went through.
    pub async fn flush_pending(&self) -> usize {
        if self.inner.flushing.swap(true, Ordering::SeqCst) {
            return 0;
        }

        let mut flushed = 0;
        loop {
            let next = lock(&self.inner.retry).pop_ready();
            let Some(entry) = next else {
                break;
            };
            let increment_of = match &entry.op {
                PendingOp::Increment { session_id, .. } => Some(session_id.clone()),
                PendingOp::Close { .. } => None,
            };

            let outcome = match &entry.op {
                PendingOp::Increment {
                    session_id,
                    minutes,
                    ..
                } => {
                    self.inner
                        .store
                        .increment_duration(session_id.clone(), *minutes)
                        .await
                }
                PendingOp::Close { session_id, patch } => {
                    self.inner
                        .store
                        .update_session(session_id.clone(), patch.clone())
                        .await
                }
            };

            let requeue = matches!(
                &outcome,
                Err(err) if !matches!(err, SyncError::Validation(_) | SyncError::Conflict(_))
            );
            {
                let mut retry = lock(&self.inner.retry);
                if requeue {
                    retry.restore(entry.clone());
                }
                if let Some(session_id) = &increment_of {
                    retry.end_increment(session_id);
                }
            }

            match outcome {
                Ok(()) => {
                    flushed += 1;
                    match &entry.op {
                        PendingOp::Increment {
                            task_id,
                            minutes,
                            focus,
                            ..
                        } => self.credit(task_id, *minutes, *focus).await,
                        PendingOp::Close { session_id, patch } => {
                            self.inner.events.publish(SyncEvent::SessionClosed {
                                session_id: session_id.clone(),
                                status: patch.status,
                            });
                        }
                    }
                }
                Err(err @ (SyncError::Validation(_) | SyncError::Conflict(_))) => {
                    log_error!("Dropping queued update for {}: {}", entry.op.session_id(), err);
                }
                Err(err) => {
                    log_warn!("Replay failed, keeping {} queued: {}", entry.op.session_id(), err);
                    self.raise_sync_error(&err).await;
                    break;
                }
            }
        }

        self.inner.flushing.store(false, Ordering::SeqCst);

        if flushed > 0 {
            log_info!("Replayed {} queued session updates", flushed);
            let drained = lock(&self.inner.retry).is_empty();
            if drained {
                self.inner.state.lock().await.sync_error = None;
            }
        }
        flushed
    }

    /// Reconcile with a timer state pushed from another device.
    pub async fn sync_from_remote_state(&self, remote: RemoteTimerState) -> TimerState {
        let (resolution, snapshot) = {
            let mut state = self.inner.state.lock().await;
            let resolution = resolve(&state, &self.inner.identity.device_id, &remote);
            match &resolution {
                Resolution::Ignore => {}
                Resolution::AdoptRemote => adopt_remote(&mut state, &remote),
                Resolution::KeepLocal { .. } => state.is_active_device_for_this_timer = true,
                Resolution::YieldToRemote { .. } => {
                    state.active_session = None;
                    adopt_remote(&mut state, &remote);
                }
            }
            (resolution, state.clone())
        };

        match resolution {
            Resolution::Ignore => return snapshot,
            Resolution::AdoptRemote => {
                log_info!("Adopted timer state from device {}", remote.device_id);
            }
            Resolution::KeepLocal { close_remote } => {
                if let Some(session_id) = close_remote {
                    log_info!(
                        "Keeping local session; closing {} from device {}",
                        session_id,
                        remote.device_id
                    );
                    self.close_in_background(session_id, SessionStatus::Switched);
                }
            }
            Resolution::YieldToRemote { close_local } => {
                self.release_lease();
                if let Some(session_id) = close_local {
                    log_info!(
                        "Device {} owns the timer now; closing local session {}",
                        remote.device_id,
                        session_id
                    );
                    self.close_in_background(session_id, SessionStatus::Switched);
                }
            }
        }

        self.emit_state().await;
        snapshot
    }

    /// Flush queued operations whenever `monitor` reports a connection.
    pub fn attach_monitor(&self, monitor: ConnectionMonitor) {
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let subscription = monitor.add_listener(move |state| {
            if !state.is_connected {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                return;
            };
            let engine = SessionSyncEngine { inner };
            handle.spawn(async move {
                engine.flush_pending().await;
            });
        });

        let previous = lock(&self.inner.monitor).replace((monitor, subscription));
        if let Some((_, subscription)) = previous {
            subscription.unsubscribe();
        }
    }

    /// Drive [`tick`](Self::tick) once per second until [`stop_ticker`](Self::stop_ticker).
    pub fn start_ticker(&self) {
        let mut ticker = lock(&self.inner.ticker);
        if ticker.as_ref().map_or(false, |handle| !handle.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        *ticker = Some(tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                SessionSyncEngine { inner }.tick().await;
            }
        }));
    }

    pub fn stop_ticker(&self) {
        if let Some(handle) = lock(&self.inner.ticker).take() {
            handle.abort();
        }
    }

    pub fn shutdown(&self) {
        self.stop_ticker();
        if let Some((_, subscription)) = lock(&self.inner.monitor).take() {
            subscription.unsubscribe();
        }
    }

    async fn open_session(&self, task: Task) -> Result<TimerState, SyncError> {
        let mut task = task;
        loop {
            let lease = match self.inner.locks.acquire(&task.id) {
                StartClaim::Leader(lease) => lease,
                StartClaim::Follower(claim) => return self.follow(task, claim).await,
            };

            let (mode, started_at) = {
                let state = self.inner.state.lock().await;
                if state.active_session.is_some() {
                    log_debug!("Session opened while acquiring the start lock");
                    return Ok(state.clone());
                }
                (state.mode, Utc::now())
            };

            let request = NewWorkSession {
                user_id: self.inner.identity.user_id.clone(),
                task_id: Some(task.id.clone()),
                project_id: task.project_id.clone(),
                session_type: mode,
                start_time: started_at,
                date: session_date(started_at, self.inner.settings.utc_offset_minutes),
                device_id: self.inner.identity.device_id.clone(),
            };

            let session_id = match self.inner.store.create_session(request).await {
                Ok(session_id) => session_id,
                Err(err) => {
                    drop(lease);
                    return Err(self.start_failed(err).await);
                }
            };

            let session = ActiveSession::opened(session_id.clone(), task.id.clone(), started_at);
            let opening = {
                let mut state = self.inner.state.lock().await;
                let selected = state.current_task.as_ref().map(|current| current.id.clone());
                if state.active_session.is_some() {
                    Opening::Duplicate(state.clone())
                } else if selected.as_deref() != Some(task.id.as_str()) {
                    Opening::TaskChanged(state.current_task.clone())
                } else {
                    state.open(session.clone(), true);
                    lease.open(session.clone());
                    Opening::Opened(state.clone())
                }
            };

            let snapshot = match opening {
                Opening::Opened(snapshot) => snapshot,
                Opening::Duplicate(snapshot) => {
                    log_warn!("Closing duplicate session {}", session_id);
                    drop(lease);
                    self.close_in_background(session_id, SessionStatus::Switched);
                    return Ok(snapshot);
                }
                Opening::TaskChanged(selected) => {
                    log_warn!(
                        "Task changed while session {} was opening for {}; closing it",
                        session_id,
                        task.id
                    );
                    drop(lease);
                    self.close_in_background(session_id, SessionStatus::Switched);
                    match selected {
                        Some(selected) => {
                            task = selected;
                            continue;
                        }
                        None => {
                            return Err(SyncError::Conflict(
                                "task was cleared while the session was opening".into(),
                            ))
                        }
                    }
                }
            };

            *lock(&self.inner.lease) = Some(lease);
            log_info!(
                "Opened {} session {} for task {} (engine {})",
                mode.as_str(),
                session.session_id,
                session.task_id,
                self.inner.engine_id
            );
            self.inner.events.publish(SyncEvent::SessionOpened {
                session_id: session.session_id,
                task_id: session.task_id,
            });
            self.emit_state().await;
            return Ok(snapshot);
        }
    }

    /// Wait for the tab that is already starting `task` and mirror its session.
    async fn follow(
        &self,
        task: Task,
        mut claim: watch::Receiver<ClaimState>,
    ) -> Result<TimerState, SyncError> {
        let wait = Duration::from_millis(self.inner.settings.start_lock_wait_ms);
        let outcome = match time::timeout(wait, claim.wait_for(|s| *s != ClaimState::Pending)).await {
            Ok(Ok(state)) => state.clone(),
            _ => ClaimState::Released,
        };

        let ClaimState::Open(session) = outcome else {
            return Err(SyncError::Conflict(format!(
                "another tab is starting task {}",
                task.id
            )));
        };

        let snapshot = {
            let mut state = self.inner.state.lock().await;
            if state.session_id() == Some(session.session_id.as_str()) {
                return Ok(state.clone());
            }
            if state.is_running {
                return Err(SyncError::Conflict(
                    "timer is already running another session".into(),
                ));
            }
            match state.current_task.as_ref() {
                Some(current) if current.id != task.id => {
                    return Err(SyncError::Conflict(format!(
                        "task changed while waiting to follow {}",
                        session.session_id
                    )));
                }
                Some(_) => {}
                None => state.current_task = Some(task),
            }
            state.open(session.clone(), false);
            state.clone()
        };

        log_info!("Following session {} opened by another tab", session.session_id);
        self.emit_state().await;
        Ok(snapshot)
    }

    async fn start_failed(&self, err: SyncError) -> SyncError {
        log_error!("Could not open a session: {}", err);
        {
            let mut state = self.inner.state.lock().await;
            state.is_running = false;
            state.sync_error = Some(err.user_message());
        }
        self.inner.events.publish(SyncEvent::SyncErrorRaised {
            message: err.user_message(),
        });
        self.emit_state().await;
        err
    }

    async fn complete(&self) -> TimerState {
        let (session, owner, next_mode) = {
            let mut state = self.inner.state.lock().await;
            state.is_running = false;
            if state.mode.is_focus() {
                state.completed_pomodoros += 1;
            }
            (
                state.active_session.clone(),
                state.is_active_device_for_this_timer,
                state.next_mode(&self.inner.settings),
            )
        };

        if let Some(session) = session.filter(|_| owner) {
            let patch = SessionPatch::closed(SessionStatus::Completed, Utc::now());
            let result = self
                .inner
                .store
                .update_session(session.session_id.clone(), patch.clone())
                .await;
            self.finish_close(session.session_id, patch, result).await;
        }

        let snapshot = {
            let mut state = self.inner.state.lock().await;
            state.active_session = None;
            state.reset_for_mode(next_mode, &self.inner.settings);
            state.clone()
        };
        self.release_lease();
        log_info!("Timer completed; next up {}", next_mode.as_str());
        self.emit_state().await;

        if !(owner && self.inner.settings.auto_start_next) {
            return snapshot;
        }
        let Some(task) = snapshot.current_task.clone() else {
            return snapshot;
        };
        match self.open_session(task).await {
            Ok(next) => next,
            Err(err) => {
                log_warn!("Could not auto-start {}: {}", next_mode.as_str(), err);
                self.snapshot().await
            }
        }
    }

    /// Report crossed minutes right away. While earlier minutes for the same
    /// session are still on the wire or waiting in the retry queue, new ones
    /// join the retry queue behind them.
    fn submit_increment(&self, job: IncrementJob) {
        {
            let mut retry = lock(&self.inner.retry);
            if retry.holds_increments(&job.session_id) {
                log_debug!(
                    "Queueing {} minute(s) behind earlier ones for {}",
                    job.minutes,
                    job.session_id
                );
                retry.push(job.into_op());
                return;
            }
            retry.begin_increment(&job.session_id);
        }

        let pending = self
            .inner
            .store
            .increment_duration(job.session_id.clone(), job.minutes);

        self.inner.in_flight.send_modify(|count| *count += 1);
        let engine = self.clone();
        tokio::spawn(async move {
            let result = pending.await;
            engine.finish_increment(job, result).await;
            engine
                .inner
                .in_flight
                .send_modify(|count| *count = count.saturating_sub(1));
        });
    }

    async fn finish_increment(&self, job: IncrementJob, result: Result<(), SyncError>) {
        match result {
            Ok(()) => {
                lock(&self.inner.retry).end_increment(&job.session_id);
                self.credit(&job.task_id, job.minutes, job.focus).await;
                self.kick_flush();
            }
            Err(err @ SyncError::Validation(_)) => {
                lock(&self.inner.retry).end_increment(&job.session_id);
                log_error!(
                    "Session {} refused {} minute(s): {}",
                    job.session_id,
                    job.minutes,
                    err
                );
                self.halt(err).await;
            }
            Err(err) => {
                log_warn!(
                    "Could not report {} minute(s) for {}: {}; queued",
                    job.minutes,
                    job.session_id,
                    err
                );
                {
                    let mut retry = lock(&self.inner.retry);
                    let session_id = job.session_id.clone();
                    retry.push(job.into_op());
                    retry.end_increment(&session_id);
                }
                if err.is_retryable() {
                    self.raise_sync_error(&err).await;
                } else {
                    self.halt(err).await;
                }
            }
        }
    }

    async fn credit(&self, task_id: &str, minutes: u32, focus: bool) {
        let drained = lock(&self.inner.retry).is_empty();
        let total = {
            let mut state = self.inner.state.lock().await;
            if drained {
                state.sync_error = None;
            }
            if focus {
                state
                    .current_task
                    .as_mut()
                    .filter(|task| task.id == task_id)
                    .map(|task| {
                        task.accumulated_minutes += minutes;
                        task.accumulated_minutes
                    })
            } else {
                None
            }
        };

        if let Some(total_minutes) = total {
            self.inner.events.publish(SyncEvent::DeepFocusTimeUpdated {
                task_id: task_id.to_string(),
                total_minutes,
            });
        }
    }

    /// Stop the timer after a failure that retrying cannot fix.
    async fn halt(&self, err: SyncError) {
        log_error!("Stopping timer: {}", err);
        let session = {
            let mut state = self.inner.state.lock().await;
            state.is_running = false;
            state.sync_error = Some(err.user_message());
            state.active_session.take()
        };
        self.release_lease();

        if let Some(session) = session {
            if !matches!(err, SyncError::Validation(_)) {
                lock(&self.inner.retry).push(PendingOp::Close {
                    session_id: session.session_id,
                    patch: SessionPatch::closed(SessionStatus::Paused, Utc::now()),
                });
            }
        }

        self.inner.events.publish(SyncEvent::SyncErrorRaised {
            message: err.user_message(),
        });
        self.emit_state().await;
    }

    /// Close a session without holding up the caller. The update is issued
    /// immediately; a failure lands in the retry queue.
    fn close_in_background(&self, session_id: String, status: SessionStatus) {
        let patch = SessionPatch::closed(status, Utc::now());
        let pending = self
            .inner
            .store
            .update_session(session_id.clone(), patch.clone());

        self.inner.in_flight.send_modify(|count| *count += 1);
        let engine = self.clone();
        tokio::spawn(async move {
            let result = pending.await;
            engine.finish_close(session_id, patch, result).await;
            engine
                .inner
                .in_flight
                .send_modify(|count| *count = count.saturating_sub(1));
        });
    }

    async fn finish_close(&self, session_id: String, patch: SessionPatch, result: Result<(), SyncError>) {
        match result {
            Ok(()) => {
                log_debug!("Closed session {} as {}", session_id, patch.status.as_str());
                self.inner.events.publish(SyncEvent::SessionClosed {
                    session_id,
                    status: patch.status,
                });
            }
            Err(err @ SyncError::Validation(_)) => {
                log_error!("Store refused to close {}: {}", session_id, err);
            }
            Err(err) => {
                log_warn!("Close of {} failed: {}; queued for retry", session_id, err);
                lock(&self.inner.retry).push(PendingOp::Close { session_id, patch });
                self.raise_sync_error(&err).await;
            }
        }
    }

    async fn raise_sync_error(&self, err: &SyncError) {
        let message = err.user_message();
        self.inner.state.lock().await.sync_error = Some(message.clone());
        self.inner
            .events
            .publish(SyncEvent::SyncErrorRaised { message });
    }

    fn release_lease(&self) {
        let lease = lock(&self.inner.lease).take();
        drop(lease);
    }

    fn connected(&self) -> bool {
        lock(&self.inner.monitor)
            .as_ref()
            .map_or(true, |(monitor, _)| monitor.is_connected())
    }

    async fn emit_state(&self) {
        let state = self.snapshot().await;
        self.inner
            .events
            .publish(SyncEvent::TimerStateChanged { state });
    }
}

fn adopt_remote(state: &mut TimerState, remote: &RemoteTimerState) {
    state.mode = remote.mode;
    state.current_time_remaining = remote.current_time_remaining;
    state.total_time = remote.total_time;
    state.last_counted_minute = remote.last_counted_minute;
    if remote.current_task.is_some() {
        state.current_task = remote.current_task.clone();
    }

    let running =
        remote.is_running && remote.active_session.is_some() && state.current_task.is_some();
    state.is_running = running;
    state.active_session = if running {
        remote.active_session.clone()
    } else {
        None
    };
    state.is_active_device_for_this_timer = false;
}
