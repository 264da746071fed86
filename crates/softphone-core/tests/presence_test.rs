//! BLF subscriptions: batching, refresh, staleness and notifications

mod common;

use std::time::Duration;

use common::{config, connected, dialog_info, settle};
use rvoip_softphone_core::mock::MockOp;
use rvoip_softphone_core::{
    EngineError, EngineEvent, PhoneError, PhoneEvent, PresenceValue, SubscriptionStatus,
};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_monitored_extensions_subscribed_once_registered() {
    let mut h = connected(config().with_monitored_extensions(["201", "202"])).await;

    assert_eq!(h.engine.subscribe_count("201"), 1);
    assert_eq!(h.engine.subscribe_count("202"), 1);
    let info = h.phone.subscription("201").unwrap();
    assert_eq!(info.status, SubscriptionStatus::Pending);
    assert_eq!(info.presence, PresenceValue::Unknown);

    h.drain();
    h.notify("201", &dialog_info("confirmed"));
    settle().await;

    let info = h.phone.subscription("201").unwrap();
    assert_eq!(info.status, SubscriptionStatus::Active);
    assert_eq!(info.presence, PresenceValue::Busy);
    assert!(info.last_notification_at.is_some());
    assert!(h.drain().iter().any(|event| matches!(
        event,
        PhoneEvent::PresenceChanged { extension, previous: PresenceValue::Unknown, current: PresenceValue::Busy }
            if extension == "201"
    )));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_subscribe_sends_one_request() {
    let h = connected(config()).await;

    let first = h.phone.subscribe_presence("300").await.unwrap();
    let second = h.phone.subscribe_presence("300").await.unwrap();

    assert_eq!(h.engine.subscribe_count("300"), 1);
    assert_eq!(first.created_at, second.created_at);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_at_ninety_percent_of_expiry() {
    let h = connected(config()).await;

    h.phone.subscribe_presence("201").await.unwrap();
    let subscribed_at = Instant::now();
    let due = h.phone.presence_manager().refresh_due("201").unwrap();
    assert_eq!(due - subscribed_at, Duration::from_secs(3240));

    tokio::time::sleep(Duration::from_secs(3239)).await;
    assert_eq!(h.engine.subscribe_count("201"), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.engine.subscribe_count("201"), 2);
    assert!(h.phone.presence_manager().is_refresh_scheduled("201"));
}

#[tokio::test(start_paused = true)]
async fn test_stale_sweep_renews_only_quiet_subscriptions() {
    let mut h = connected(config()).await;
    h.phone.subscribe_presence("201").await.unwrap();
    h.phone.subscribe_presence("202").await.unwrap();
    h.notify("201", "available");
    h.notify("202", "available");
    settle().await;
    h.drain();

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_secs(100)).await;
        h.notify("202", "available");
    }
    settle().await;

    assert_eq!(h.engine.subscribe_count("201"), 2);
    assert_eq!(h.engine.subscribe_count("202"), 1);
    let stale: Vec<String> = h
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            PhoneEvent::SubscriptionStale { extension, .. } => Some(extension),
            _ => None,
        })
        .collect();
    assert_eq!(stale, vec!["201".to_string()]);
    assert_eq!(h.phone.subscription("201").unwrap().status, SubscriptionStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn test_batch_subscribe_continues_past_failures() {
    let mut h = connected(config()).await;
    h.engine
        .fail_subscribe_for("202", 4, EngineError::rejected(404, "Not Found"));

    let report = h
        .phone
        .batch_subscribe_presence(["201", "202", "203", "201"])
        .await
        .unwrap();

    assert_eq!(report.subscribed, vec!["201".to_string(), "203".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "202");
    assert_eq!(h.engine.subscribe_count("201"), 1);
    assert_eq!(h.engine.subscribe_count("202"), 4);

    let failed = h.phone.subscription("202").unwrap();
    assert_eq!(failed.status, SubscriptionStatus::Failed);
    assert_eq!(failed.retry_count, 3);
    assert!(h.drain().iter().any(|event| matches!(
        event,
        PhoneEvent::SubscriptionFailed { extension, attempts: 4, .. } if extension == "202"
    )));

    // A failed subscription may be requested again
    let report = h.phone.batch_subscribe_presence(["201", "202"]).await.unwrap();
    assert_eq!(report.already_active, vec!["201".to_string()]);
    assert_eq!(report.subscribed, vec!["202".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_batches_are_spaced_by_batch_delay() {
    let mut cfg = config();
    cfg.presence.batch_size = 2;
    let h = connected(cfg).await;

    h.phone
        .batch_subscribe_presence(["201", "202", "203"])
        .await
        .unwrap();

    let instants = h.engine.instants_of(MockOp::Subscribe);
    assert_eq!(instants.len(), 3);
    assert_eq!(instants[1], instants[0]);
    assert_eq!(instants[2] - instants[0], Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn test_terminated_subscription_is_renewed() {
    let h = connected(config()).await;
    h.phone.subscribe_presence("201").await.unwrap();
    h.notify("201", &dialog_info("early"));
    settle().await;
    assert_eq!(h.phone.subscription("201").unwrap().presence, PresenceValue::Ringing);

    h.engine.emit(EngineEvent::SubscriptionTerminated {
        extension: "201".to_string(),
        reason: "deactivated".to_string(),
    });
    settle().await;

    assert_eq!(h.engine.subscribe_count("201"), 2);
    let info = h.phone.subscription("201").unwrap();
    assert_eq!(info.status, SubscriptionStatus::Pending);
    assert_eq!(info.presence, PresenceValue::Ringing);
}

#[tokio::test(start_paused = true)]
async fn test_empty_notification_keeps_presence() {
    let h = connected(config()).await;
    h.phone.subscribe_presence("201").await.unwrap();
    h.notify("201", &dialog_info("confirmed"));
    settle().await;

    h.notify("201", "");
    settle().await;
    assert_eq!(h.phone.subscription("201").unwrap().presence, PresenceValue::Busy);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_removes_record() {
    let mut h = connected(config()).await;
    h.phone.subscribe_presence("201").await.unwrap();
    h.drain();

    h.phone.unsubscribe_presence("201").await.unwrap();
    assert!(h.phone.subscription("201").is_none());
    assert!(!h.phone.presence_manager().is_refresh_scheduled("201"));
    assert!(h.drain().iter().any(|event| matches!(
        event,
        PhoneEvent::SubscriptionRemoved { extension } if extension == "201"
    )));

    // Releasing again is a no-op
    h.phone.unsubscribe_presence("201").await.unwrap();
    assert_eq!(h.engine.count(MockOp::Unsubscribe), 1);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_failure_is_reported() {
    let h = connected(config()).await;
    h.engine.fail_always(MockOp::Subscribe, EngineError::rejected(403, "Forbidden"));

    let result = h.phone.subscribe_presence("201").await;
    assert!(matches!(result, Err(PhoneError::SubscriptionFailed { attempts: 4, .. })));
}
