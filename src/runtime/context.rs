use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::settings::RuntimeSettings;

use super::RuntimeHost;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContextStatus {
    pub api_available: bool,
    pub context_valid: bool,
    pub process_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Stateless checks of whether the host runtime is alive. No retries, no side effects.
#[derive(Clone)]
pub struct ContextValidator {
    host: Arc<dyn RuntimeHost>,
    settings: RuntimeSettings,
}

impl ContextValidator {
    pub fn new(host: Arc<dyn RuntimeHost>, settings: RuntimeSettings) -> Self {
        Self { host, settings }
    }

    /// True only if the messaging API exists, a process id is obtainable, and an
    /// internal resource URL resolves with the expected scheme. A panicking host
    /// counts as unreachable.
    pub fn is_runtime_reachable(&self) -> bool {
        panic::catch_unwind(AssertUnwindSafe(|| self.check())).unwrap_or(false)
    }

    pub fn describe_status(&self) -> ContextStatus {
        let api_available =
            panic::catch_unwind(AssertUnwindSafe(|| self.host.messaging_available()))
                .unwrap_or(false);
        let process_id = if api_available {
            panic::catch_unwind(AssertUnwindSafe(|| self.host.process_id()))
                .ok()
                .flatten()
        } else {
            None
        };

        ContextStatus {
            api_available,
            context_valid: self.is_runtime_reachable(),
            process_id,
            timestamp: Utc::now(),
        }
    }

    fn check(&self) -> bool {
        if !self.host.messaging_available() {
            return false;
        }
        if self.host.process_id().is_none() {
            return false;
        }
        self.host
            .resource_url(&self.settings.probe_resource_path)
            .map_or(false, |url| url.starts_with(&self.settings.expected_url_scheme))
    }
}
