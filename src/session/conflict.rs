//! Deciding which device owns the running timer when two of them disagree.

use serde::{Deserialize, Serialize};

use crate::models::{ActiveSession, Task, TimerMode};

use super::TimerState;

/// Timer state pushed from another device of the same user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTimerState {
    pub device_id: String,
    pub is_running: bool,
    pub mode: TimerMode,
    pub current_time_remaining: u32,
    pub total_time: u32,
    #[serde(default)]
    pub last_counted_minute: Option<u32>,
    #[serde(default)]
    pub current_task: Option<Task>,
    #[serde(default)]
    pub active_session: Option<ActiveSession>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Nothing to reconcile.
    Ignore,
    /// Local timer is idle: take the remote state as is and follow it.
    AdoptRemote,
    /// Local timer stays authoritative. The remote session, if any, is closed.
    KeepLocal { close_remote: Option<String> },
    /// Remote timer wins. The local session, if any, is closed.
    YieldToRemote { close_local: Option<String> },
}

/// The more recently updated session wins. Equal update times go to the
/// device whose id sorts first, so both sides reach the same answer.
pub fn resolve(local: &TimerState, local_device: &str, remote: &RemoteTimerState) -> Resolution {
    if remote.device_id == local_device {
        return Resolution::Ignore;
    }

    if !local.is_running {
        return Resolution::AdoptRemote;
    }

    let local_session = local.active_session.as_ref();
    let remote_session = remote.active_session.as_ref().filter(|_| remote.is_running);

    let Some(remote_session) = remote_session else {
        return Resolution::KeepLocal { close_remote: None };
    };

    if local_session.map(|session| session.session_id.as_str())
        == Some(remote_session.session_id.as_str())
    {
        return Resolution::Ignore;
    }

    let local_updated = local_session.map(|session| session.last_update_time);
    let local_wins = match local_updated.cmp(&Some(remote_session.last_update_time)) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => local_device < remote.device_id.as_str(),
    };

    if local_wins {
        Resolution::KeepLocal {
            close_remote: Some(remote_session.session_id.clone()),
        }
    } else {
        Resolution::YieldToRemote {
            close_local: local_session.map(|session| session.session_id.clone()),
        }
    }
}
