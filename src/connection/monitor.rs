//! Connection health of one execution context.
//!
//! Exactly one monitor exists per context; clones share the same state. The
//! flag flips on probe results only, and listeners hear about transitions,
//! never about steady-state repeats.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    events::{EventBus, SyncEvent},
    runtime::MessageChannel,
    settings::MonitorSettings,
};

use super::Backoff;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub is_connected: bool,
    pub last_ping_time: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    /// Reconnection gave up; only new outbound traffic triggers another cycle.
    pub degraded: bool,
}

/// Host lifecycle events that warrant an immediate probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    VisibilityRestored,
    WindowFocused,
}

type Listener = Arc<dyn Fn(&ConnectionState) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

struct MonitorInner {
    channel: MessageChannel,
    settings: MonitorSettings,
    events: Option<EventBus>,
    state: Mutex<ConnectionState>,
    listeners: Mutex<Listeners>,
    reconnecting: AtomicBool,
    connected_tx: watch::Sender<bool>,
    signal: Notify,
    cancel: Mutex<CancellationToken>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ConnectionMonitor {
    inner: Arc<MonitorInner>,
}

/// Handle returned by [`ConnectionMonitor::add_listener`].
pub struct Subscription {
    id: u64,
    monitor: Weak<MonitorInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.monitor.upgrade() {
            let mut listeners = lock(&inner.listeners);
            listeners.entries.retain(|(id, _)| *id != self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionMonitor {
    pub fn new(channel: MessageChannel, settings: MonitorSettings, events: Option<EventBus>) -> Self {
        let (connected_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(MonitorInner {
                channel,
                settings,
                events,
                state: Mutex::new(ConnectionState::default()),
                listeners: Mutex::new(Listeners::default()),
                reconnecting: AtomicBool::new(false),
                connected_tx,
                signal: Notify::new(),
                cancel: Mutex::new(CancellationToken::new()),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.state).clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.state).is_connected
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::SeqCst)
    }

    /// Receiver that observes the connected flag.
    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.inner.connected_tx.subscribe()
    }

    /// Probe now, then every `probe_interval` and on every [`HostSignal`].
    /// Calling `start` on a running monitor does nothing.
    pub fn start(&self) {
        let mut worker = lock(&self.inner.worker);
        if worker.as_ref().map_or(false, |handle| !handle.is_finished()) {
            log_debug!("Connection monitor already running");
            return;
        }

        let cancel = {
            let mut token = lock(&self.inner.cancel);
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
            token.clone()
        };

        let monitor = self.clone();
        let interval = self.inner.settings.probe_interval();
        *worker = Some(tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        log_info!("Connection monitor shutting down");
                        break;
                    }
                    _ = ticker.tick() => monitor.scheduled_probe().await,
                    _ = monitor.inner.signal.notified() => monitor.scheduled_probe().await,
                }
            }
        }));
    }

    pub fn stop(&self) {
        lock(&self.inner.cancel).cancel();
        if let Some(handle) = lock(&self.inner.worker).take() {
            handle.abort();
        }
    }

    /// Report a visibility or focus change from the host.
    pub fn notify(&self, signal: HostSignal) {
        log_debug!("Host signal {:?}; probing connection", signal);
        self.inner.signal.notify_one();
    }

    /// One liveness round-trip. Never fails; the outcome only flips the flag.
    pub async fn probe(&self) -> bool {
        let alive = self
            .inner
            .channel
            .ping(self.inner.settings.probe_timeout())
            .await;
        self.record_probe(alive);
        alive
    }

    /// Retry probing with exponential backoff and jitter. Returns whether the
    /// connection came back. Concurrent calls collapse into the running cycle.
    pub async fn reconnect(&self) -> bool {
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            log_debug!("Reconnect already in progress");
            return false;
        }

        let settings = &self.inner.settings;
        let backoff = Backoff::from_millis(
            settings.reconnect_base_ms,
            settings.reconnect_max_ms,
            settings.reconnect_jitter_ms,
        );
        let cancel = lock(&self.inner.cancel).clone();

        let mut recovered = false;
        for attempt in 1..=settings.max_reconnect_attempts {
            self.update_state(|state| state.reconnect_attempts = attempt);
            let delay = backoff.delay_with_jitter(attempt - 1);
            log_info!(
                "Reconnect attempt {}/{} in {:?}",
                attempt,
                settings.max_reconnect_attempts,
                delay
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = time::sleep(delay) => {}
            }

            if self.probe().await {
                recovered = true;
                break;
            }
        }

        if !recovered {
            self.update_state(|state| state.degraded = true);
            log_warn!(
                "Connection not restored after {} attempts; waiting for new traffic",
                settings.max_reconnect_attempts
            );
        }

        self.inner.reconnecting.store(false, Ordering::SeqCst);
        recovered
    }

    /// External trigger from outbound traffic: leaves the degraded state by
    /// starting a fresh reconnect cycle.
    pub fn nudge(&self) {
        let degraded = {
            let state = lock(&self.inner.state);
            state.degraded && !state.is_connected
        };
        if degraded && !self.is_reconnecting() {
            self.update_state(|state| {
                state.degraded = false;
                state.reconnect_attempts = 0;
            });
            self.spawn_reconnect();
        }
    }

    /// The callback runs immediately with the current state, then on every transition.
    pub fn add_listener<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        let callback: Listener = Arc::new(callback);
        let id = {
            let mut listeners = lock(&self.inner.listeners);
            let id = listeners.next_id;
            listeners.next_id += 1;
            listeners.entries.push((id, callback.clone()));
            id
        };

        callback(&self.state());

        Subscription {
            id,
            monitor: Arc::downgrade(&self.inner),
        }
    }

    async fn scheduled_probe(&self) {
        if self.probe().await {
            return;
        }
        if !lock(&self.inner.state).degraded {
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(&self) {
        if self.is_reconnecting() {
            return;
        }
        let monitor = self.clone();
        tokio::spawn(async move {
            monitor.reconnect().await;
        });
    }

    fn update_state<F>(&self, apply: F)
    where
        F: FnOnce(&mut ConnectionState),
    {
        apply(&mut lock(&self.inner.state));
    }

    fn record_probe(&self, alive: bool) {
        let (changed, snapshot) = {
            let mut state = lock(&self.inner.state);
            let was_connected = state.is_connected;
            state.is_connected = alive;
            state.last_ping_time = Some(Utc::now());
            if alive {
                state.reconnect_attempts = 0;
                state.degraded = false;
            }
            (was_connected != alive, state.clone())
        };

        if !changed {
            return;
        }

        self.inner.connected_tx.send_replace(alive);
        if alive {
            log_info!("Connection to background context established");
        } else {
            log_warn!("Connection to background context lost");
        }

        let listeners: Vec<Listener> = lock(&self.inner.listeners)
            .entries
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(&snapshot);
        }

        if let Some(events) = &self.inner.events {
            events.publish(SyncEvent::ConnectionChanged { state: snapshot });
        }
    }
}
