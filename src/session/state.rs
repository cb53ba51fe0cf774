use serde::{Deserialize, Serialize};

use crate::{
    models::{ActiveSession, Task, TimerMode},
    settings::TimerSettings,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    pub is_running: bool,
    /// Seconds left in the current mode.
    pub current_time_remaining: u32,
    /// Full length of the current mode in seconds.
    pub total_time: u32,
    pub mode: TimerMode,
    /// Last whole elapsed minute that was reported to the store.
    pub last_counted_minute: Option<u32>,
    pub current_task: Option<Task>,
    pub active_session: Option<ActiveSession>,
    /// Only the owning device reports duration for the open session.
    pub is_active_device_for_this_timer: bool,
    pub sync_error: Option<String>,
    pub completed_pomodoros: u32,
}

/// What one second of running time produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub minutes_crossed: u32,
    pub completed: bool,
}

impl TimerState {
    pub fn new(settings: &TimerSettings) -> Self {
        let total = mode_seconds(TimerMode::Pomodoro, settings);
        Self {
            is_running: false,
            current_time_remaining: total,
            total_time: total,
            mode: TimerMode::Pomodoro,
            last_counted_minute: None,
            current_task: None,
            active_session: None,
            is_active_device_for_this_timer: false,
            sync_error: None,
            completed_pomodoros: 0,
        }
    }

    pub fn elapsed_secs(&self) -> u32 {
        self.total_time.saturating_sub(self.current_time_remaining)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.active_session
            .as_ref()
            .map(|session| session.session_id.as_str())
    }

    /// Count down one second and report minute boundaries crossed since the
    /// last counted minute.
    pub fn advance(&mut self) -> TickReport {
        if !self.is_running {
            return TickReport::default();
        }

        self.current_time_remaining = self.current_time_remaining.saturating_sub(1);
        let elapsed_minutes = self.elapsed_secs() / 60;
        let counted = self.last_counted_minute.unwrap_or(0);
        let minutes_crossed = elapsed_minutes.saturating_sub(counted);
        if minutes_crossed > 0 {
            self.last_counted_minute = Some(elapsed_minutes);
        }

        TickReport {
            minutes_crossed,
            completed: self.current_time_remaining == 0,
        }
    }

    pub fn open(&mut self, session: ActiveSession, owner: bool) {
        self.active_session = Some(session);
        self.is_running = true;
        self.is_active_device_for_this_timer = owner;
        self.sync_error = None;
    }

    pub fn next_mode(&self, settings: &TimerSettings) -> TimerMode {
        match self.mode {
            TimerMode::Pomodoro => {
                let interval = settings.long_break_interval.max(1);
                if self.completed_pomodoros > 0 && self.completed_pomodoros % interval == 0 {
                    TimerMode::LongBreak
                } else {
                    TimerMode::ShortBreak
                }
            }
            TimerMode::ShortBreak | TimerMode::LongBreak => TimerMode::Pomodoro,
        }
    }

    pub fn reset_for_mode(&mut self, mode: TimerMode, settings: &TimerSettings) {
        let total = mode_seconds(mode, settings);
        self.mode = mode;
        self.total_time = total;
        self.current_time_remaining = total;
        self.last_counted_minute = None;
    }

    /// Running state and the open session always travel together, and a
    /// running timer always has a task.
    pub fn is_consistent(&self) -> bool {
        self.is_running == self.active_session.is_some()
            && (!self.is_running || self.current_task.is_some())
    }
}

pub fn mode_seconds(mode: TimerMode, settings: &TimerSettings) -> u32 {
    let minutes = match mode {
        TimerMode::Pomodoro => settings.pomodoro_minutes,
        TimerMode::ShortBreak => settings.short_break_minutes,
        TimerMode::LongBreak => settings.long_break_minutes,
    };
    minutes.saturating_mul(60)
}
