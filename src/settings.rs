use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::RwLock, time::Duration};

/// Tunables of the delivery queue. Retry defaults differ between hosts, so none
/// of these are contracts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueSettings {
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_jitter_ms: u64,
    pub send_timeout_ms: u64,
    /// Pause between liveness re-checks while the context is unavailable.
    pub context_wait_ms: u64,
    pub recovery_max_attempts: u32,
    pub recovery_base_ms: u64,
    pub recovery_max_ms: u64,
    /// Serialized messages larger than this are sent in chunks.
    pub chunk_threshold_bytes: usize,
    pub chunk_size_bytes: usize,
    /// Extra error text that marks a lost context, on top of the built-in list.
    pub context_loss_signatures: Vec<String>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_ms: 1_000,
            retry_max_ms: 30_000,
            retry_jitter_ms: 1_000,
            send_timeout_ms: 10_000,
            context_wait_ms: 1_000,
            recovery_max_attempts: 5,
            recovery_base_ms: 500,
            recovery_max_ms: 8_000,
            chunk_threshold_bytes: 32 * 1024 * 1024,
            chunk_size_bytes: 1024 * 1024,
            context_loss_signatures: Vec::new(),
        }
    }
}

impl QueueSettings {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn context_wait(&self) -> Duration {
        Duration::from_millis(self.context_wait_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitorSettings {
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_jitter_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            probe_interval_ms: 30_000,
            probe_timeout_ms: 5_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            reconnect_jitter_ms: 1_000,
            max_reconnect_attempts: 5,
        }
    }
}

impl MonitorSettings {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TimerSettings {
    pub pomodoro_minutes: u32,
    pub short_break_minutes: u32,
    pub long_break_minutes: u32,
    /// A long break follows every N completed pomodoros.
    pub long_break_interval: u32,
    pub auto_start_next: bool,
    pub heartbeat_every_ticks: u32,
    /// Offset used to derive a session's calendar date.
    pub utc_offset_minutes: i32,
    /// How long a tab waits for another tab's in-flight start of the same task.
    pub start_lock_wait_ms: u64,
}

impl Default for TimerSettings {
    fn default() -> Self {
        let debug_mode = std::env::var("FOCUS_SYNC_DEBUG")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            pomodoro_minutes: 25,
            short_break_minutes: 5,
            long_break_minutes: 15,
            long_break_interval: 4,
            auto_start_next: false,
            heartbeat_every_ticks: if debug_mode { 1 } else { 10 },
            utc_offset_minutes: 0,
            start_lock_wait_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeSettings {
    /// Scheme an internal resource URL must resolve to for the context to count as alive.
    pub expected_url_scheme: String,
    pub probe_resource_path: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            expected_url_scheme: "chrome-extension://".into(),
            probe_resource_path: "manifest.json".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncSettings {
    pub queue: QueueSettings,
    pub monitor: MonitorSettings,
    pub timer: TimerSettings,
    pub runtime: RuntimeSettings,
}

/// Settings persisted as JSON next to the extension's other local data.
pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<SyncSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            match serde_json::from_str(&contents) {
                Ok(settings) => settings,
                Err(err) => {
                    log::warn!(
                        "Ignoring unreadable settings at {}: {err}",
                        path.display()
                    );
                    SyncSettings::default()
                }
            }
        } else {
            SyncSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn settings(&self) -> SyncSettings {
        self.data
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn update<F>(&self, apply: F) -> Result<SyncSettings>
    where
        F: FnOnce(&mut SyncSettings),
    {
        let mut guard = self
            .data
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        apply(&mut guard);
        self.persist(&guard)?;
        Ok(guard.clone())
    }

    fn persist(&self, data: &SyncSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create settings directory {}", parent.display())
            })?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
