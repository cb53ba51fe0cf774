use std::{sync::Arc, time::Duration};

use focus_sync::{
    connection::ConnectionMonitor,
    db::Database,
    delivery::{EnqueueOptions, MessageDeliveryQueue, RecoveryPhase},
    error::DeliveryError,
    events::SyncEvent,
    memory::LoopbackHost,
    runtime::{ContextValidator, MessageChannel},
    settings::{MonitorSettings, QueueSettings, RuntimeSettings},
    EventBus,
};
use serde_json::json;

fn queue_for(host: &Arc<LoopbackHost>, settings: QueueSettings) -> MessageDeliveryQueue {
    MessageDeliveryQueue::builder(
        MessageChannel::new(host.clone()),
        ContextValidator::new(host.clone(), RuntimeSettings::default()),
    )
    .settings(settings)
    .build()
}

#[tokio::test(start_paused = true)]
async fn offline_messages_wait_for_the_context_and_go_out_once() {
    let host = Arc::new(LoopbackHost::echo());
    host.set_online(false);

    let channel = MessageChannel::new(host.clone());
    let monitor = ConnectionMonitor::new(channel.clone(), MonitorSettings::default(), None);
    let queue = MessageDeliveryQueue::builder(
        channel,
        ContextValidator::new(host.clone(), RuntimeSettings::default()),
    )
    .monitor(monitor.clone())
    .build();

    let ticket = queue.enqueue(
        "incrementDuration",
        json!({ "sessionId": "session-1", "minutes": 1 }),
        EnqueueOptions::default(),
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(host.sent().is_empty());
    assert_eq!(queue.stats().queue_depth, 1);

    host.set_online(true);
    assert!(monitor.probe().await);

    ticket.await.unwrap();
    assert_eq!(host.sent_of_kind("incrementDuration").len(), 1);
    assert_eq!(queue.stats().queue_depth, 0);
}

#[tokio::test(start_paused = true)]
async fn context_loss_is_recovered_without_spending_retries() {
    let host = Arc::new(LoopbackHost::echo());
    host.fail_next_sends(2, "Extension context invalidated.");
    host.fail_pings(1);
    let queue = queue_for(&host, QueueSettings::default());

    let reply = queue
        .enqueue("createSession", json!({ "taskId": "task-1" }), EnqueueOptions::default())
        .await
        .unwrap();
    assert_eq!(reply["taskId"], "task-1");

    let delivered = host.sent_of_kind("createSession");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0]["attempt"], 0);
    assert_eq!(queue.recovery_state().phase, RecoveryPhase::Healthy);
    assert_eq!(queue.stats().retried, 0);
    assert_eq!(host.ping_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_recovery_fails_every_pending_message_once() {
    let host = Arc::new(LoopbackHost::echo());
    host.fail_next_sends(10, "Could not establish connection. Receiving end does not exist.");
    host.fail_pings(10);

    let events = EventBus::new();
    let mut rx = events.subscribe();
    let queue = MessageDeliveryQueue::builder(
        MessageChannel::new(host.clone()),
        ContextValidator::new(host.clone(), RuntimeSettings::default()),
    )
    .settings(QueueSettings {
        recovery_max_attempts: 3,
        ..QueueSettings::default()
    })
    .events(events.clone())
    .build();

    let tickets: Vec<_> = (0..3)
        .map(|n| queue.enqueue("noop", json!({ "n": n }), EnqueueOptions::default()))
        .collect();
    for ticket in tickets {
        assert!(matches!(
            ticket.await,
            Err(DeliveryError::RecoveryExhausted(_))
        ));
    }

    assert_eq!(queue.recovery_state().phase, RecoveryPhase::Failed);
    assert_eq!(host.ping_count(), 3);

    let mut failures = 0;
    while let Ok(event) = rx.try_recv() {
        if let SyncEvent::RecoveryPhaseChanged {
            phase: RecoveryPhase::Failed,
        } = event
        {
            failures += 1;
        }
    }
    assert_eq!(failures, 1);

    let refused = queue
        .enqueue("noop", json!({}), EnqueueOptions::default())
        .await;
    assert_eq!(refused, Err(DeliveryError::QueueFailed));
}

#[tokio::test(start_paused = true)]
async fn concurrent_recoveries_share_one_probe_sequence() {
    let host = Arc::new(LoopbackHost::echo());
    host.fail_pings(1);
    let queue = queue_for(&host, QueueSettings::default());

    let (first, second) = tokio::join!(queue.recover(), queue.recover());
    assert!(first);
    assert!(second);
    assert_eq!(host.ping_count(), 2);
    assert_eq!(queue.recovery_state().phase, RecoveryPhase::Healthy);
}

#[tokio::test(start_paused = true)]
async fn large_messages_travel_in_chunks() {
    let host = Arc::new(LoopbackHost::echo());
    let queue = queue_for(
        &host,
        QueueSettings {
            chunk_threshold_bytes: 256,
            chunk_size_bytes: 64,
            ..QueueSettings::default()
        },
    );

    let text = "focus ✓ ".repeat(100);
    let reply = queue
        .enqueue("bulkImport", json!({ "text": text }), EnqueueOptions::default())
        .await
        .unwrap();

    assert_eq!(reply["text"], text);
    assert_eq!(host.sent_of_kind("bulkImport").len(), 1);
    assert_eq!(host.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn a_retried_message_keeps_its_place_at_the_head() {
    let host = Arc::new(LoopbackHost::echo());
    host.fail_next_sends(1, "network glitch");
    let queue = queue_for(&host, QueueSettings::default());

    let first = queue.enqueue("noop", json!({ "n": 1 }), EnqueueOptions::default());
    let second = queue.enqueue("noop", json!({ "n": 2 }), EnqueueOptions::default());
    first.await.unwrap();
    second.await.unwrap();

    let sent = host.sent_of_kind("noop");
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0]["payload"]["n"], 1);
    assert_eq!(sent[0]["attempt"], 1);
    assert_eq!(sent[1]["payload"]["n"], 2);
    assert_eq!(queue.stats().retried, 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_give_up_after_max_retries() {
    let host = Arc::new(LoopbackHost::echo());
    host.fail_next_sends(5, "service unavailable");
    let queue = queue_for(&host, QueueSettings::default());

    let result = queue
        .enqueue(
            "noop",
            json!({}),
            EnqueueOptions {
                max_retries: Some(2),
                ..EnqueueOptions::default()
            },
        )
        .await;

    assert!(matches!(
        result,
        Err(DeliveryError::RetriesExhausted { attempts: 2, .. })
    ));
    assert!(host.sent().is_empty());
}

#[tokio::test]
async fn undelivered_messages_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outbox.sqlite3");

    {
        let host = Arc::new(LoopbackHost::echo());
        host.set_online(false);
        let outbox = Database::new(path.clone()).unwrap();
        let queue = MessageDeliveryQueue::builder(
            MessageChannel::new(host.clone()),
            ContextValidator::new(host.clone(), RuntimeSettings::default()),
        )
        .outbox(outbox.clone())
        .build();

        let first = queue.enqueue("noop", json!({ "n": 1 }), EnqueueOptions::default());
        let second = queue.enqueue("noop", json!({ "n": 2 }), EnqueueOptions::default());
        queue.shutdown();
        assert_eq!(first.await, Err(DeliveryError::Shutdown));
        assert_eq!(second.await, Err(DeliveryError::Shutdown));
        assert_eq!(outbox.load_envelopes().await.unwrap().len(), 2);
    }

    let host = Arc::new(LoopbackHost::echo());
    let outbox = Database::new(path).unwrap();
    let queue = MessageDeliveryQueue::builder(
        MessageChannel::new(host.clone()),
        ContextValidator::new(host.clone(), RuntimeSettings::default()),
    )
    .outbox(outbox.clone())
    .build();

    assert_eq!(queue.restore().await.unwrap(), 2);

    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.stats().successful < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let sent = host.sent_of_kind("noop");
    assert_eq!(sent[0]["payload"]["n"], 1);
    assert_eq!(sent[1]["payload"]["n"], 2);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !outbox.load_envelopes().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}
