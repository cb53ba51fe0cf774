//! Work-session records: the local shadow (`ActiveSession`) and the remote row
//! (`WorkSession`) it mirrors.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum TimerMode {
    Pomodoro,
    ShortBreak,
    LongBreak,
}

impl Default for TimerMode {
    fn default() -> Self {
        TimerMode::Pomodoro
    }
}

impl TimerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerMode::Pomodoro => "pomodoro",
            TimerMode::ShortBreak => "shortBreak",
            TimerMode::LongBreak => "longBreak",
        }
    }

    pub fn is_focus(&self) -> bool {
        matches!(self, TimerMode::Pomodoro)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Active,
    Paused,
    /// Closed because another session took over (task switch or another device).
    Switched,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Switched => "switched",
            SessionStatus::Completed => "completed",
        }
    }

    pub fn is_closed(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

/// Local shadow of the remote session that is currently open on this device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    pub session_id: String,
    pub task_id: String,
    pub start_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    pub status: SessionStatus,
}

impl ActiveSession {
    pub fn opened(session_id: String, task_id: String, at: DateTime<Utc>) -> Self {
        Self {
            session_id,
            task_id,
            start_time: at,
            last_update_time: at,
            status: SessionStatus::Active,
        }
    }
}

/// Remote, durable work-session row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkSession {
    pub id: String,
    pub user_id: String,
    pub task_id: String,
    pub project_id: Option<String>,
    /// Minutes.
    pub duration: u32,
    pub session_type: TimerMode,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub date: NaiveDate,
}

/// Payload of `createSession`. Identifiers are optional so the store can reject
/// incomplete requests with a validation error instead of a panic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewWorkSession {
    pub user_id: Option<String>,
    pub task_id: Option<String>,
    pub project_id: Option<String>,
    pub session_type: TimerMode,
    pub start_time: DateTime<Utc>,
    pub date: NaiveDate,
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl SessionPatch {
    pub fn closed(status: SessionStatus, end_time: DateTime<Utc>) -> Self {
        Self {
            status,
            end_time: Some(end_time),
        }
    }
}
