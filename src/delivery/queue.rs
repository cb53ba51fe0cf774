//! Ordered, at-least-once delivery to the background context.
//!
//! One drain task runs at a time. It always works on the oldest pending
//! envelope; a message that failed transiently keeps its place at the head, so
//! later messages never overtake it.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
    time::Duration,
};

use chrono::Utc;
use serde_json::Value;
use tokio::{
    sync::{oneshot, watch},
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    connection::{Backoff, ConnectionMonitor},
    db::Database,
    error::{classify_failure, DeliveryError, FailureClass, TransportError},
    events::{EventBus, SyncEvent},
    models::{Envelope, Priority},
    runtime::{
        protocol::{ChunkComplete, WireMessage},
        ContextValidator, MessageChannel,
    },
    settings::QueueSettings,
};

use super::{
    chunking::split_into_frames,
    recovery::{RecoveryPhase, RecoveryState},
    stats::{Counters, QueueStats},
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

type Responder = oneshot::Sender<Result<Value, DeliveryError>>;

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Priority,
    /// Overrides `QueueSettings::max_retries` for this message.
    pub max_retries: Option<u32>,
    /// Overrides `QueueSettings::send_timeout_ms` for this message.
    pub timeout: Option<Duration>,
}

impl EnqueueOptions {
    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }
}

/// Resolves once the message is delivered or given up on.
pub struct DeliveryTicket {
    id: Uuid,
    rx: oneshot::Receiver<Result<Value, DeliveryError>>,
}

impl DeliveryTicket {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Future for DeliveryTicket {
    type Output = Result<Value, DeliveryError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(DeliveryError::Shutdown)))
    }
}

struct PendingEnvelope {
    envelope: Envelope,
    /// `None` for envelopes replayed from the outbox.
    responder: Option<Responder>,
    max_retries: u32,
    timeout: Duration,
    not_before: Option<Instant>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingEnvelope>,
    processing: bool,
    recovery: RecoveryState,
    counters: Counters,
}

struct QueueInner {
    channel: MessageChannel,
    validator: ContextValidator,
    monitor: Option<ConnectionMonitor>,
    settings: QueueSettings,
    events: Option<EventBus>,
    outbox: Option<Database>,
    state: Mutex<QueueState>,
    phase_tx: watch::Sender<RecoveryPhase>,
    shutdown: CancellationToken,
}

pub struct QueueBuilder {
    channel: MessageChannel,
    validator: ContextValidator,
    settings: QueueSettings,
    monitor: Option<ConnectionMonitor>,
    events: Option<EventBus>,
    outbox: Option<Database>,
}

impl QueueBuilder {
    pub fn settings(mut self, settings: QueueSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn monitor(mut self, monitor: ConnectionMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn outbox(mut self, outbox: Database) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn build(self) -> MessageDeliveryQueue {
        let (phase_tx, _) = watch::channel(RecoveryPhase::Healthy);
        MessageDeliveryQueue {
            inner: Arc::new(QueueInner {
                channel: self.channel,
                validator: self.validator,
                monitor: self.monitor,
                settings: self.settings,
                events: self.events,
                outbox: self.outbox,
                state: Mutex::new(QueueState::default()),
                phase_tx,
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

#[derive(Clone)]
pub struct MessageDeliveryQueue {
    inner: Arc<QueueInner>,
}

impl MessageDeliveryQueue {
    pub fn builder(channel: MessageChannel, validator: ContextValidator) -> QueueBuilder {
        QueueBuilder {
            channel,
            validator,
            settings: QueueSettings::default(),
            monitor: None,
            events: None,
            outbox: None,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    /// Append a message and return immediately. The ticket resolves with the
    /// peer's reply data or the final delivery error.
    pub fn enqueue(&self, kind: &str, payload: Value, options: EnqueueOptions) -> DeliveryTicket {
        let envelope = Envelope::new(kind, payload, options.priority);
        let (tx, rx) = oneshot::channel();
        let ticket = DeliveryTicket { id: envelope.id, rx };

        let refusal = {
            let mut state = self.lock_state();
            state.counters.total += 1;
            if self.inner.shutdown.is_cancelled() {
                state.counters.failed += 1;
                Some(DeliveryError::Shutdown)
            } else if state.recovery.phase == RecoveryPhase::Failed {
                state.counters.failed += 1;
                Some(DeliveryError::QueueFailed)
            } else {
                None
            }
        };
        if let Some(error) = refusal {
            log_warn!("Refusing {} message {}: {}", envelope.kind, envelope.id, error);
            let _ = tx.send(Err(error));
            return ticket;
        }

        if let Some(outbox) = &self.inner.outbox {
            spawn_outbox_write("persist", outbox.persist_envelope(&envelope));
        }

        log_debug!(
            "Enqueued {} message {} ({})",
            envelope.kind,
            envelope.id,
            envelope.priority.as_str()
        );

        let start_drain = {
            let mut state = self.lock_state();
            state.pending.push_back(PendingEnvelope {
                envelope,
                responder: Some(tx),
                max_retries: options.max_retries.unwrap_or(self.inner.settings.max_retries),
                timeout: options
                    .timeout
                    .unwrap_or_else(|| self.inner.settings.send_timeout()),
                not_before: None,
            });
            !std::mem::replace(&mut state.processing, true)
        };

        if let Some(monitor) = &self.inner.monitor {
            monitor.nudge();
        }
        if start_drain {
            self.spawn_drain();
        }
        ticket
    }

    /// Replay envelopes left in the outbox by a previous process. Their
    /// original callers are gone, so outcomes are only logged.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let Some(outbox) = &self.inner.outbox else {
            return Ok(0);
        };
        let envelopes = outbox.load_envelopes().await?;
        let restored = envelopes.len();
        if restored == 0 {
            return Ok(0);
        }

        self.reset_recovery();
        let start_drain = {
            let mut state = self.lock_state();
            for envelope in envelopes {
                state.counters.total += 1;
                state.pending.push_back(PendingEnvelope {
                    envelope,
                    responder: None,
                    max_retries: self.inner.settings.max_retries,
                    timeout: self.inner.settings.send_timeout(),
                    not_before: None,
                });
            }
            !std::mem::replace(&mut state.processing, true)
        };
        log_info!("Restored {} undelivered messages from outbox", restored);

        if start_drain {
            self.spawn_drain();
        }
        Ok(restored)
    }

    /// Leave FAILED after the embedder has re-established the context.
    pub fn reset_recovery(&self) {
        let previous = {
            let mut state = self.lock_state();
            let previous = state.recovery.phase;
            state.recovery.reset();
            previous
        };
        if previous != RecoveryPhase::Healthy {
            log_info!("Recovery state reset from {:?}", previous);
            self.publish_phase(RecoveryPhase::Healthy);
        }
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.lock_state().recovery.clone()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock_state();
        QueueStats {
            total: state.counters.total,
            successful: state.counters.successful,
            failed: state.counters.failed,
            retried: state.counters.retried,
            queue_depth: state.pending.len(),
            recovery_phase: state.recovery.phase,
        }
    }

    pub fn log_status(&self) {
        let stats = self.stats();
        log::info!(
            "Delivery queue: depth={} total={} ok={} failed={} retried={} phase={:?}",
            stats.queue_depth,
            stats.total,
            stats.successful,
            stats.failed,
            stats.retried,
            stats.recovery_phase
        );
    }

    /// Stop draining and reject everything still pending.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.reject_all(DeliveryError::Shutdown);
    }

    /// Run the context recovery procedure. Only one runs at a time; a second
    /// caller waits for the running one and shares its outcome.
    pub async fn recover(&self) -> bool {
        let mut phase_rx = self.inner.phase_tx.subscribe();
        let owner = {
            let mut state = self.lock_state();
            match state.recovery.phase {
                RecoveryPhase::Failed => return false,
                RecoveryPhase::Recovering => false,
                RecoveryPhase::Healthy => state.recovery.begin(),
            }
        };

        if !owner {
            log_debug!("Recovery already running; waiting for its outcome");
            let outcome = phase_rx
                .wait_for(|phase| *phase != RecoveryPhase::Recovering)
                .await
                .map(|phase| *phase);
            return matches!(outcome, Ok(RecoveryPhase::Healthy));
        }

        self.publish_phase(RecoveryPhase::Recovering);
        let settings = &self.inner.settings;
        log_warn!(
            "Extension context lost; attempting recovery ({} attempts)",
            settings.recovery_max_attempts
        );

        let backoff = Backoff::from_millis(settings.recovery_base_ms, settings.recovery_max_ms, 0);
        for attempt in 0..settings.recovery_max_attempts {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = time::sleep(backoff.delay(attempt)) => {}
            }

            self.lock_state().recovery.record_attempt(Utc::now());
            if self.probe_context().await {
                self.lock_state().recovery.succeed();
                self.publish_phase(RecoveryPhase::Healthy);
                log_info!("Context recovered after {} attempts", attempt + 1);
                return true;
            }
        }

        self.lock_state().recovery.fail();
        self.publish_phase(RecoveryPhase::Failed);
        log_error!(
            "Context recovery failed after {} attempts; rejecting pending messages",
            settings.recovery_max_attempts
        );
        self.reject_all(DeliveryError::RecoveryExhausted(format!(
            "no live context after {} attempts",
            settings.recovery_max_attempts
        )));
        false
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_drain(&self) {
        let queue = self.clone();
        tokio::spawn(async move { queue.drain().await });
    }

    async fn drain(self) {
        loop {
            if self.inner.shutdown.is_cancelled() {
                self.lock_state().processing = false;
                return;
            }

            let head = {
                let mut state = self.lock_state();
                let phase = state.recovery.phase;
                match state.pending.front() {
                    None => {
                        state.processing = false;
                        return;
                    }
                    Some(pending) => (
                        pending.envelope.clone(),
                        pending.timeout,
                        pending.not_before,
                        phase,
                    ),
                }
            };
            let (envelope, timeout, not_before, phase) = head;

            match phase {
                RecoveryPhase::Failed => {
                    self.reject_all(DeliveryError::QueueFailed);
                    continue;
                }
                RecoveryPhase::Recovering => {
                    self.wait_for_recovery().await;
                    continue;
                }
                RecoveryPhase::Healthy => {}
            }

            if let Some(at) = not_before {
                if at > Instant::now() {
                    tokio::select! {
                        _ = self.inner.shutdown.cancelled() => {}
                        _ = time::sleep_until(at) => {}
                    }
                    continue;
                }
            }

            if !self.context_ready() {
                self.wait_for_context().await;
                continue;
            }

            match self.transmit(&envelope, timeout).await {
                Ok(reply) => {
                    log_debug!("Delivered {} message {}", envelope.kind, envelope.id);
                    self.settle(envelope.id, Ok(reply));
                }
                Err(err) => {
                    match classify_failure(&err, &self.inner.settings.context_loss_signatures) {
                        FailureClass::Validation => {
                            log_warn!("{} message {} rejected: {}", envelope.kind, envelope.id, err);
                            self.settle(envelope.id, Err(DeliveryError::Rejected(err.to_string())));
                        }
                        FailureClass::Transient => self.schedule_retry(envelope.id, &err),
                        FailureClass::ContextLost => {
                            log_warn!("Context loss while sending {}: {}", envelope.id, err);
                            // The envelope stays at the head with its attempts
                            // untouched; the next pass retries or rejects it.
                            self.recover().await;
                        }
                    }
                }
            }
        }
    }

    fn context_ready(&self) -> bool {
        self.inner.validator.is_runtime_reachable()
            && self
                .inner
                .monitor
                .as_ref()
                .map_or(true, |monitor| monitor.is_connected())
    }

    async fn wait_for_context(&self) {
        let delay = self.inner.settings.context_wait();
        let monitor = self
            .inner
            .monitor
            .as_ref()
            .filter(|_| self.inner.validator.is_runtime_reachable());

        match monitor {
            Some(monitor) => {
                monitor.nudge();
                let mut connected = monitor.watch_connected();
                tokio::select! {
                    _ = self.inner.shutdown.cancelled() => {}
                    _ = connected.wait_for(|connected| *connected) => {}
                    _ = time::sleep(delay) => {}
                }
            }
            None => {
                log_debug!("Runtime unreachable; pausing delivery for {:?}", delay);
                tokio::select! {
                    _ = self.inner.shutdown.cancelled() => {}
                    _ = time::sleep(delay) => {}
                }
            }
        }
    }

    async fn wait_for_recovery(&self) {
        let mut phase_rx = self.inner.phase_tx.subscribe();
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => {}
            _ = phase_rx.wait_for(|phase| *phase != RecoveryPhase::Recovering) => {}
        }
    }

    async fn probe_context(&self) -> bool {
        if !self.inner.validator.is_runtime_reachable() {
            return false;
        }
        match &self.inner.monitor {
            Some(monitor) => monitor.probe().await,
            None => {
                self.inner
                    .channel
                    .ping(self.inner.settings.send_timeout())
                    .await
            }
        }
    }

    async fn transmit(&self, envelope: &Envelope, timeout: Duration) -> Result<Value, TransportError> {
        let wire = WireMessage::from(envelope);
        let serialized = serde_json::to_string(&wire)
            .map_err(|err| TransportError::Rejected(format!("unencodable payload: {err}")))?;

        if serialized.len() <= self.inner.settings.chunk_threshold_bytes {
            let message = serde_json::to_value(&wire)
                .map_err(|err| TransportError::Rejected(format!("unencodable payload: {err}")))?;
            return self.inner.channel.request(message, timeout).await;
        }

        let frames = split_into_frames(
            envelope.id,
            &serialized,
            self.inner.settings.chunk_size_bytes,
        );
        log_info!(
            "Sending {} message {} in {} chunks ({} bytes)",
            envelope.kind,
            envelope.id,
            frames.len(),
            serialized.len()
        );
        for frame in frames {
            let message = serde_json::to_value(&frame)
                .map_err(|err| TransportError::Rejected(format!("unencodable chunk: {err}")))?;
            self.inner.channel.request(message, timeout).await?;
        }

        let complete = serde_json::to_value(ChunkComplete::new(envelope.id))
            .map_err(|err| TransportError::Rejected(format!("unencodable chunk: {err}")))?;
        self.inner.channel.request(complete, timeout).await
    }

    fn schedule_retry(&self, id: Uuid, err: &TransportError) {
        let exhausted = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let Some(pending) = state
                .pending
                .iter_mut()
                .find(|pending| pending.envelope.id == id)
            else {
                return;
            };

            pending.envelope.attempts += 1;
            let attempts = pending.envelope.attempts;
            if attempts >= pending.max_retries {
                Some(attempts)
            } else {
                let settings = &self.inner.settings;
                let delay = Backoff::from_millis(
                    settings.retry_base_ms,
                    settings.retry_max_ms,
                    settings.retry_jitter_ms,
                )
                .delay_with_jitter(attempts);
                pending.not_before = Some(Instant::now() + delay);
                state.counters.retried += 1;
                log_warn!(
                    "Send of {} failed (attempt {}): {}; retrying in {:?}",
                    id,
                    attempts,
                    err,
                    delay
                );
                if let Some(outbox) = &self.inner.outbox {
                    spawn_outbox_write("attempts", outbox.record_envelope_attempts(id, attempts));
                }
                None
            }
        };

        if let Some(attempts) = exhausted {
            log_error!("Giving up on {} after {} attempts: {}", id, attempts, err);
            self.settle(
                id,
                Err(DeliveryError::RetriesExhausted {
                    attempts,
                    last_error: err.to_string(),
                }),
            );
        }
    }

    /// Resolve one envelope and forget it. Unknown ids were already settled.
    fn settle(&self, id: Uuid, result: Result<Value, DeliveryError>) {
        let pending = {
            let mut state = self.lock_state();
            let Some(position) = state
                .pending
                .iter()
                .position(|pending| pending.envelope.id == id)
            else {
                return;
            };
            if result.is_ok() {
                state.counters.successful += 1;
            } else {
                state.counters.failed += 1;
            }
            state.pending.remove(position)
        };

        if let Some(pending) = pending {
            self.finish(pending, result);
        }
    }

    fn reject_all(&self, error: DeliveryError) {
        let drained: Vec<PendingEnvelope> = {
            let mut state = self.lock_state();
            let rejected = state.pending.len() as u64;
            state.counters.failed += rejected;
            state.pending.drain(..).collect()
        };
        if !drained.is_empty() {
            log_warn!("Rejecting {} pending messages: {}", drained.len(), error);
        }
        for pending in drained {
            self.finish(pending, Err(error.clone()));
        }
    }

    /// Messages cut off by shutdown stay in the outbox for the next process.
    fn finish(&self, pending: PendingEnvelope, result: Result<Value, DeliveryError>) {
        let keep = matches!(result, Err(DeliveryError::Shutdown));
        if let Some(outbox) = self.inner.outbox.as_ref().filter(|_| !keep) {
            spawn_outbox_write("delete", outbox.delete_envelope(pending.envelope.id));
        }
        match pending.responder {
            Some(responder) => {
                let _ = responder.send(result);
            }
            None => {
                if let Err(err) = result {
                    log_warn!(
                        "Replayed {} message {} failed: {}",
                        pending.envelope.kind,
                        pending.envelope.id,
                        err
                    );
                }
            }
        }
    }

    fn publish_phase(&self, phase: RecoveryPhase) {
        self.inner.phase_tx.send_replace(phase);
        if let Some(events) = &self.inner.events {
            events.publish(SyncEvent::RecoveryPhaseChanged { phase });
        }
    }
}

fn spawn_outbox_write<F>(operation: &'static str, write: F)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = write.await {
            log::warn!("Outbox {operation} failed: {err:#}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::LoopbackHost, settings::RuntimeSettings};
    use serde_json::json;

    fn queue(host: Arc<LoopbackHost>, settings: QueueSettings) -> MessageDeliveryQueue {
        MessageDeliveryQueue::builder(
            MessageChannel::new(host.clone()),
            ContextValidator::new(host, RuntimeSettings::default()),
        )
        .settings(settings)
        .build()
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_and_counts() {
        let host = Arc::new(LoopbackHost::echo());
        let queue = queue(host.clone(), QueueSettings::default());

        let reply = queue
            .enqueue("noop", json!({ "n": 1 }), EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(reply["n"], 1);

        let stats = queue.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.queue_depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_messages_are_not_retried() {
        let host = Arc::new(LoopbackHost::echo());
        host.reject_next_sends(1, "missing taskId");
        let queue = queue(host.clone(), QueueSettings::default());

        let result = queue
            .enqueue("createSession", json!({}), EnqueueOptions::default())
            .await;
        assert!(matches!(result, Err(DeliveryError::Rejected(_))));
        assert_eq!(host.sent_of_kind("createSession").len(), 1);
        assert_eq!(queue.stats().retried, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_queue_refuses_new_messages_until_reset() {
        let host = Arc::new(LoopbackHost::echo());
        let settings = QueueSettings {
            recovery_max_attempts: 2,
            ..QueueSettings::default()
        };
        let queue = queue(host.clone(), settings);

        host.set_online(false);
        assert!(!queue.recover().await);
        assert_eq!(queue.recovery_state().phase, RecoveryPhase::Failed);

        let refused = queue
            .enqueue("noop", json!({}), EnqueueOptions::default())
            .await;
        assert_eq!(refused, Err(DeliveryError::QueueFailed));

        host.set_online(true);
        queue.reset_recovery();
        assert!(queue
            .enqueue("noop", json!({}), EnqueueOptions::default())
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_rejects_pending_messages() {
        let host = Arc::new(LoopbackHost::echo());
        host.set_online(false);
        let queue = queue(host.clone(), QueueSettings::default());

        let ticket = queue.enqueue("noop", json!({}), EnqueueOptions::default());
        tokio::task::yield_now().await;
        queue.shutdown();
        assert_eq!(ticket.await, Err(DeliveryError::Shutdown));
    }
}
