pub mod connection;
pub mod dates;
pub mod db;
pub mod delivery;
pub mod error;
pub mod events;
pub mod memory;
pub mod models;
pub mod runtime;
pub mod session;
pub mod settings;
pub mod utils;

use std::{fs, path::Path, sync::Arc};

use anyhow::{Context, Result};
use log::info;

pub use connection::{ConnectionMonitor, ConnectionState, HostSignal};
pub use db::Database;
pub use delivery::{DeliveryTicket, EnqueueOptions, MessageDeliveryQueue, RecoveryPhase};
pub use error::{DeliveryError, SyncError, TransportError};
pub use events::{EventBus, SyncEvent};
pub use models::{Priority, SessionStatus, Task, TimerMode};
pub use runtime::{ContextValidator, MessageChannel, RuntimeHost};
pub use session::{
    DeviceIdentity, QueuedSessionStore, RemoteSessionStore, RemoteTimerState, SessionSyncEngine,
    StartLockRegistry, TimerState,
};
pub use settings::{SettingsStore, SyncSettings};

/// The wired-up subsystem of one execution context: a connection monitor, the
/// delivery queue on top of it and the session engine talking through the queue.
pub struct FocusSync {
    monitor: ConnectionMonitor,
    queue: MessageDeliveryQueue,
    engine: SessionSyncEngine,
    events: EventBus,
}

pub struct FocusSyncBuilder {
    host: Arc<dyn RuntimeHost>,
    identity: DeviceIdentity,
    settings: SyncSettings,
    outbox: Option<Database>,
    locks: StartLockRegistry,
}

impl FocusSyncBuilder {
    pub fn settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn outbox(mut self, outbox: Database) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn locks(mut self, locks: StartLockRegistry) -> Self {
        self.locks = locks;
        self
    }

    pub fn build(self) -> FocusSync {
        let events = EventBus::new();
        let channel = MessageChannel::new(self.host.clone());
        let validator = ContextValidator::new(self.host, self.settings.runtime.clone());

        let monitor = ConnectionMonitor::new(
            channel.clone(),
            self.settings.monitor.clone(),
            Some(events.clone()),
        );

        let mut queue = MessageDeliveryQueue::builder(channel, validator)
            .settings(self.settings.queue.clone())
            .monitor(monitor.clone())
            .events(events.clone());
        if let Some(outbox) = self.outbox {
            queue = queue.outbox(outbox);
        }
        let queue = queue.build();

        let engine = SessionSyncEngine::builder(
            Arc::new(QueuedSessionStore::new(queue.clone())),
            self.identity,
        )
        .settings(self.settings.timer.clone())
        .locks(self.locks)
        .events(events.clone())
        .build();

        FocusSync {
            monitor,
            queue,
            engine,
            events,
        }
    }
}

impl FocusSync {
    pub fn builder(host: Arc<dyn RuntimeHost>, identity: DeviceIdentity) -> FocusSyncBuilder {
        FocusSyncBuilder {
            host,
            identity,
            settings: SyncSettings::default(),
            outbox: None,
            locks: StartLockRegistry::new(),
        }
    }

    /// Open the subsystem with settings and outbox kept under `data_dir`.
    pub fn open(
        host: Arc<dyn RuntimeHost>,
        identity: DeviceIdentity,
        data_dir: &Path,
    ) -> Result<Self> {
        utils::init_logging();

        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let settings = SettingsStore::new(data_dir.join("settings.json"))?.settings();
        let outbox = Database::new(data_dir.join("focus-sync.sqlite3"))?;

        info!("Focus sync opened for device {}", identity.device_id);

        Ok(Self::builder(host, identity)
            .settings(settings)
            .outbox(outbox)
            .build())
    }

    /// Start probing, replay the persisted outbox and begin ticking. Returns
    /// the number of restored messages.
    pub async fn start(&self) -> Result<usize> {
        self.monitor.start();
        let restored = self.queue.restore().await?;
        if restored > 0 {
            info!("Restored {} undelivered messages", restored);
        }
        self.engine.attach_monitor(self.monitor.clone());
        self.engine.start_ticker();
        Ok(restored)
    }

    pub fn shutdown(&self) {
        self.engine.shutdown();
        self.queue.shutdown();
        self.monitor.stop();
    }

    pub fn engine(&self) -> &SessionSyncEngine {
        &self.engine
    }

    pub fn queue(&self) -> &MessageDeliveryQueue {
        &self.queue
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}
