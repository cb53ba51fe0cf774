use std::{sync::Arc, time::Duration};

use chrono::Utc;
use focus_sync::{
    error::SyncError,
    events::SyncEvent,
    memory::{FailureMode, LoopbackHost, MemorySessionStore, StoreCall},
    models::{ActiveSession, NewWorkSession, SessionStatus, Task, TimerMode},
    session::{
        store::{CREATE_SESSION, INCREMENT_DURATION, UPDATE_SESSION},
        DeviceIdentity, RemoteSessionStore, RemoteTimerState, SessionSyncEngine,
        StartLockRegistry,
    },
    settings::{QueueSettings, SyncSettings},
    FocusSync,
};

struct Harness {
    remote: Arc<MemorySessionStore>,
    host: Arc<LoopbackHost>,
}

impl Harness {
    fn new() -> Self {
        let remote = Arc::new(MemorySessionStore::new());
        let host = Arc::new(LoopbackHost::with_handler(remote.clone()));
        Self { remote, host }
    }

    async fn tab(&self, locks: &StartLockRegistry) -> FocusSync {
        self.tab_as(locks, Some("user-1")).await
    }

    async fn tab_as(&self, locks: &StartLockRegistry, user_id: Option<&str>) -> FocusSync {
        self.tab_with(locks, user_id, SyncSettings::default()).await
    }

    async fn tab_with(
        &self,
        locks: &StartLockRegistry,
        user_id: Option<&str>,
        settings: SyncSettings,
    ) -> FocusSync {
        let sync = FocusSync::builder(
            self.host.clone(),
            DeviceIdentity::new("device-a", user_id.map(str::to_string)),
        )
        .settings(settings)
        .locks(locks.clone())
        .build();
        assert!(sync.monitor().probe().await);
        sync
    }
}

fn write_task() -> Task {
    Task::new("task-1", "Write chapter").with_project("project-1")
}

async fn ticks(engine: &SessionSyncEngine, seconds: u32) {
    for _ in 0..seconds {
        engine.tick().await;
    }
}

async fn running(harness: &Harness) -> FocusSync {
    let sync = harness.tab(&StartLockRegistry::new()).await;
    let engine = sync.engine();
    engine.set_current_task(Some(write_task())).await.unwrap();
    engine.start().await.unwrap();
    sync
}

#[tokio::test(start_paused = true)]
async fn three_minutes_report_three_increments() {
    let harness = Harness::new();
    let sync = running(&harness).await;
    let engine = sync.engine();
    let mut events = engine.events().subscribe();

    ticks(engine, 180).await;
    engine.wait_for_pending_syncs().await;

    assert_eq!(harness.remote.increments_for("session-1"), vec![1, 1, 1]);
    assert_eq!(harness.remote.session("session-1").unwrap().duration, 3);

    let state = engine.snapshot().await;
    assert!(state.is_running);
    assert_eq!(state.current_task.unwrap().accumulated_minutes, 3);
    assert_eq!(state.last_counted_minute, Some(3));

    let mut totals = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::DeepFocusTimeUpdated { total_minutes, .. } = event {
            totals.push(total_minutes);
        }
    }
    assert_eq!(totals, vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn start_is_not_running_until_the_create_succeeds() {
    let harness = Harness::new();
    harness
        .remote
        .fail_next(CREATE_SESSION, 1, FailureMode::Transient);
    let sync = harness.tab(&StartLockRegistry::new()).await;
    let engine = sync.engine().clone();
    engine.set_current_task(Some(write_task())).await.unwrap();

    let starting = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let pending = engine.snapshot().await;
    assert!(!pending.is_running);
    assert!(pending.active_session.is_none());

    let state = starting.await.unwrap().unwrap();
    assert!(state.is_running);
    assert_eq!(state.session_id(), Some("session-1"));
    assert_eq!(harness.host.sent_of_kind(CREATE_SESSION).len(), 2);
    assert_eq!(harness.remote.create_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn tabs_starting_the_same_task_share_one_session() {
    let harness = Harness::new();
    let locks = StartLockRegistry::new();
    let first = harness.tab(&locks).await;
    let second = harness.tab(&locks).await;
    first.engine().set_current_task(Some(write_task())).await.unwrap();
    second.engine().set_current_task(Some(write_task())).await.unwrap();

    let (a, b) = tokio::join!(first.engine().start(), second.engine().start());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(harness.remote.create_calls().len(), 1);
    assert_eq!(a.session_id(), Some("session-1"));
    assert_eq!(b.session_id(), Some("session-1"));
    assert!(a.is_active_device_for_this_timer ^ b.is_active_device_for_this_timer);
}

#[tokio::test(start_paused = true)]
async fn double_start_on_one_tab_creates_once() {
    let harness = Harness::new();
    let sync = harness.tab(&StartLockRegistry::new()).await;
    let engine = sync.engine();
    engine.set_current_task(Some(write_task())).await.unwrap();

    let (a, b) = tokio::join!(engine.start(), engine.start());
    assert!(a.is_ok());
    assert!(b.is_ok());
    assert_eq!(harness.remote.create_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn pause_closes_the_session() {
    let harness = Harness::new();
    let sync = running(&harness).await;
    let engine = sync.engine();

    let state = engine.pause().await.unwrap();
    assert!(!state.is_running);
    assert!(state.active_session.is_none());
    assert!(state.sync_error.is_none());
    assert_eq!(
        harness.remote.session("session-1").unwrap().status,
        SessionStatus::Paused
    );
}

#[tokio::test(start_paused = true)]
async fn failed_pause_is_queued_and_replayed() {
    let harness = Harness::new();
    let sync = running(&harness).await;
    let engine = sync.engine();
    harness
        .remote
        .fail_next(UPDATE_SESSION, 3, FailureMode::Transient);

    let state = engine.pause().await.unwrap();
    assert!(!state.is_running);
    assert!(state.active_session.is_none());
    assert_eq!(state.sync_error.as_deref(), Some("Changes queued, will retry"));
    assert_eq!(engine.pending_sync_count(), 1);
    assert_eq!(
        harness.remote.session("session-1").unwrap().status,
        SessionStatus::Active
    );

    assert_eq!(engine.flush_pending().await, 1);
    assert_eq!(
        harness.remote.session("session-1").unwrap().status,
        SessionStatus::Paused
    );
    assert!(engine.snapshot().await.sync_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn timer_state_stays_consistent_through_a_work_session() {
    let harness = Harness::new();
    let sync = harness.tab(&StartLockRegistry::new()).await;
    let engine = sync.engine();

    engine.set_current_task(Some(write_task())).await.unwrap();
    assert!(engine.snapshot().await.is_consistent());

    engine.start().await.unwrap();
    assert!(engine.snapshot().await.is_consistent());

    ticks(engine, 90).await;
    assert!(engine.snapshot().await.is_consistent());

    engine
        .set_current_task(Some(Task::new("task-2", "Review")))
        .await
        .unwrap();
    assert!(engine.snapshot().await.is_consistent());

    engine.pause().await.unwrap();
    assert!(engine.snapshot().await.is_consistent());

    engine.set_current_task(None).await.unwrap();
    let state = engine.snapshot().await;
    assert!(state.is_consistent());
    assert!(state.current_task.is_none());
}

#[tokio::test(start_paused = true)]
async fn every_counted_minute_reaches_the_store_despite_failures() {
    let harness = Harness::new();
    let sync = running(&harness).await;
    let engine = sync.engine();

    ticks(engine, 120).await;
    harness
        .remote
        .fail_next(INCREMENT_DURATION, 3, FailureMode::Transient);
    ticks(engine, 180).await;

    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            engine.wait_for_pending_syncs().await;
            if engine.pending_sync_count() == 0 {
                break;
            }
            engine.flush_pending().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(harness.remote.session("session-1").unwrap().duration, 5);
    let state = engine.snapshot().await;
    assert_eq!(state.current_task.unwrap().accumulated_minutes, 5);
    assert!(state.sync_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn switching_tasks_closes_before_it_creates() {
    let harness = Harness::new();
    let sync = running(&harness).await;
    let engine = sync.engine();

    ticks(engine, 120).await;
    let state = engine
        .set_current_task(Some(Task::new("task-2", "Review")))
        .await
        .unwrap();
    engine.wait_for_pending_syncs().await;

    assert!(state.is_running);
    assert_eq!(state.session_id(), Some("session-2"));
    assert_eq!(
        harness.remote.session("session-1").unwrap().status,
        SessionStatus::Switched
    );

    let calls = harness.remote.calls();
    let position = |wanted: &StoreCall| calls.iter().position(|call| call == wanted).unwrap();
    let closed = position(&StoreCall::Update {
        session_id: "session-1".into(),
        status: SessionStatus::Switched,
    });
    let created = position(&StoreCall::Create {
        session_id: "session-2".into(),
        task_id: "task-2".into(),
    });
    assert!(closed < created);
    assert!(calls[..closed]
        .iter()
        .filter(|call| call.session_id() == "session-1")
        .all(|call| !matches!(call, StoreCall::Update { .. })));
    assert_eq!(harness.remote.increments_for("session-1"), vec![1, 1]);
}

#[tokio::test(start_paused = true)]
async fn completed_pomodoro_closes_and_resets_to_a_break() {
    let harness = Harness::new();
    let mut settings = SyncSettings::default();
    settings.timer.pomodoro_minutes = 2;
    let sync = FocusSync::builder(
        harness.host.clone(),
        DeviceIdentity::new("device-a", Some("user-1".into())),
    )
    .settings(settings)
    .build();
    assert!(sync.monitor().probe().await);
    let engine = sync.engine();
    engine.set_current_task(Some(write_task())).await.unwrap();
    engine.start().await.unwrap();

    ticks(engine, 120).await;
    engine.wait_for_pending_syncs().await;

    let state = engine.snapshot().await;
    assert!(!state.is_running);
    assert_eq!(state.mode, TimerMode::ShortBreak);
    assert_eq!(state.current_time_remaining, 5 * 60);
    assert_eq!(state.completed_pomodoros, 1);

    let row = harness.remote.session("session-1").unwrap();
    assert_eq!(row.status, SessionStatus::Completed);
    assert_eq!(row.duration, 2);
    assert!(row.end_time.is_some());
}

#[tokio::test(start_paused = true)]
async fn newer_remote_session_takes_over() {
    let harness = Harness::new();
    let now = Utc::now();
    let remote_id = harness
        .remote
        .create_session(NewWorkSession {
            user_id: Some("user-1".into()),
            task_id: Some("task-1".into()),
            project_id: None,
            session_type: TimerMode::Pomodoro,
            start_time: now,
            date: now.date_naive(),
            device_id: "device-b".into(),
        })
        .await
        .unwrap();

    let sync = running(&harness).await;
    let engine = sync.engine();
    let local_id = engine.snapshot().await.session_id().unwrap().to_string();

    let later = Utc::now() + chrono::Duration::minutes(1);
    let state = engine
        .sync_from_remote_state(RemoteTimerState {
            device_id: "device-b".into(),
            is_running: true,
            mode: TimerMode::Pomodoro,
            current_time_remaining: 600,
            total_time: 1500,
            last_counted_minute: Some(15),
            current_task: Some(write_task()),
            active_session: Some(ActiveSession {
                last_update_time: later,
                ..ActiveSession::opened(remote_id.clone(), "task-1".into(), now)
            }),
        })
        .await;
    engine.wait_for_pending_syncs().await;

    assert!(state.is_running);
    assert!(!state.is_active_device_for_this_timer);
    assert_eq!(state.session_id(), Some(remote_id.as_str()));
    assert_eq!(
        harness.remote.session(&local_id).unwrap().status,
        SessionStatus::Switched
    );
    assert_eq!(
        harness.remote.session(&remote_id).unwrap().status,
        SessionStatus::Active
    );
}

#[tokio::test(start_paused = true)]
async fn missing_user_fails_the_start_without_sending() {
    let harness = Harness::new();
    let sync = harness.tab_as(&StartLockRegistry::new(), None).await;
    let engine = sync.engine();
    engine.set_current_task(Some(write_task())).await.unwrap();

    let err = engine.start().await.unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));

    let state = engine.snapshot().await;
    assert!(!state.is_running);
    assert!(state.sync_error.is_some());
    assert!(harness.host.sent_of_kind(CREATE_SESSION).is_empty());
}

#[tokio::test]
async fn opens_with_settings_and_outbox_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();

    let sync = FocusSync::open(
        harness.host.clone(),
        DeviceIdentity::new("device-a", Some("user-1".into())),
        dir.path(),
    )
    .unwrap();
    assert_eq!(sync.start().await.unwrap(), 0);
    assert!(dir.path().join("focus-sync.sqlite3").exists());

    sync.engine()
        .set_current_task(Some(write_task()))
        .await
        .unwrap();
    let state = sync.engine().start().await.unwrap();
    assert_eq!(state.session_id(), Some("session-1"));

    sync.shutdown();
}

#[tokio::test(start_paused = true)]
async fn switching_task_during_a_slow_start_runs_the_new_task() {
    let harness = Harness::new();
    let sync = harness.tab(&StartLockRegistry::new()).await;
    let engine = sync.engine().clone();
    engine.set_current_task(Some(write_task())).await.unwrap();
    harness.host.set_latency(Duration::from_secs(2));

    let starting = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    engine
        .set_current_task(Some(Task::new("task-2", "Review")))
        .await
        .unwrap();

    let state = starting.await.unwrap().unwrap();
    assert!(state.is_running);
    assert_eq!(state.current_task.as_ref().unwrap().id, "task-2");
    assert_eq!(state.active_session.as_ref().unwrap().task_id, "task-2");
    assert!(state.is_consistent());

    engine.wait_for_pending_syncs().await;
    let creates: Vec<_> = harness
        .remote
        .create_calls()
        .into_iter()
        .map(|call| call.task_id.unwrap())
        .collect();
    assert_eq!(creates, vec!["task-1", "task-2"]);
    assert_eq!(
        harness.remote.session("session-1").unwrap().status,
        SessionStatus::Switched
    );

    ticks(&engine, 120).await;
    engine.wait_for_pending_syncs().await;
    assert_eq!(harness.remote.increments_for("session-2"), vec![1, 1]);
    assert!(harness.remote.increments_for("session-1").is_empty());
    let state = engine.snapshot().await;
    assert_eq!(state.current_task.unwrap().accumulated_minutes, 2);
}

#[tokio::test(start_paused = true)]
async fn later_minutes_wait_behind_one_still_retrying() {
    let harness = Harness::new();
    let settings = SyncSettings {
        queue: QueueSettings {
            retry_base_ms: 20_000,
            retry_jitter_ms: 0,
            ..QueueSettings::default()
        },
        ..SyncSettings::default()
    };
    let sync = harness
        .tab_with(&StartLockRegistry::new(), Some("user-1"), settings)
        .await;
    let engine = sync.engine();
    engine.set_current_task(Some(write_task())).await.unwrap();
    engine.start().await.unwrap();

    harness
        .remote
        .fail_next(INCREMENT_DURATION, 3, FailureMode::Transient);
    ticks(engine, 60).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    ticks(engine, 60).await;

    // The first minute is still backing off inside the delivery queue.
    assert!(harness.remote.increments_for("session-1").is_empty());
    assert_eq!(engine.pending_sync_count(), 1);

    tokio::time::sleep(Duration::from_secs(200)).await;
    engine.wait_for_pending_syncs().await;
    assert!(harness.remote.increments_for("session-1").is_empty());
    assert_eq!(engine.pending_sync_count(), 1);

    assert_eq!(engine.flush_pending().await, 1);
    assert_eq!(harness.remote.increments_for("session-1"), vec![2]);
    let state = engine.snapshot().await;
    assert_eq!(state.current_task.unwrap().accumulated_minutes, 2);
    assert!(state.sync_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn pause_while_offline_queues_the_close() {
    let harness = Harness::new();
    let sync = running(&harness).await;
    let engine = sync.engine();
    engine.attach_monitor(sync.monitor().clone());

    harness.host.set_online(false);
    assert!(!sync.monitor().probe().await);

    let state = tokio::time::timeout(Duration::from_secs(1), engine.pause())
        .await
        .unwrap()
        .unwrap();
    assert!(!state.is_running);
    assert!(state.active_session.is_none());
    assert_eq!(state.sync_error.as_deref(), Some("Changes queued, will retry"));
    assert_eq!(engine.pending_sync_count(), 1);
    assert!(harness.host.sent_of_kind(UPDATE_SESSION).is_empty());

    harness.host.set_online(true);
    assert!(sync.monitor().probe().await);
    tokio::time::timeout(Duration::from_secs(30), async {
        while harness.remote.session("session-1").unwrap().status != SessionStatus::Paused {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(engine.pending_sync_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn older_remote_session_is_closed_and_local_keeps_running() {
    let harness = Harness::new();
    let earlier = Utc::now() - chrono::Duration::minutes(5);
    let remote_id = harness
        .remote
        .create_session(NewWorkSession {
            user_id: Some("user-1".into()),
            task_id: Some("task-1".into()),
            project_id: None,
            session_type: TimerMode::Pomodoro,
            start_time: earlier,
            date: earlier.date_naive(),
            device_id: "device-b".into(),
        })
        .await
        .unwrap();

    let sync = running(&harness).await;
    let engine = sync.engine();
    let local_id = engine.snapshot().await.session_id().unwrap().to_string();

    let state = engine
        .sync_from_remote_state(RemoteTimerState {
            device_id: "device-b".into(),
            is_running: true,
            mode: TimerMode::Pomodoro,
            current_time_remaining: 900,
            total_time: 1500,
            last_counted_minute: Some(10),
            current_task: Some(write_task()),
            active_session: Some(ActiveSession::opened(
                remote_id.clone(),
                "task-1".into(),
                earlier,
            )),
        })
        .await;
    engine.wait_for_pending_syncs().await;

    assert!(state.is_running);
    assert!(state.is_active_device_for_this_timer);
    assert_eq!(state.session_id(), Some(local_id.as_str()));
    assert_eq!(
        harness.remote.session(&remote_id).unwrap().status,
        SessionStatus::Switched
    );
    assert_eq!(
        harness.remote.session(&local_id).unwrap().status,
        SessionStatus::Active
    );
}
