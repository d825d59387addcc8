use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use event_tracker::storage::in_process::InProcessAdapter;
use event_tracker::{Notification, Outcome, Tracker, TrackerConfig};
use event_tracker_core::StrategyKind;
use serde_json::json;

async fn tracker_with(config: TrackerConfig) -> Tracker {
    Tracker::builder()
        .storage(Arc::new(InProcessAdapter::new()))
        .config(config)
        .build()
        .await
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn simple_strategy_admits_then_defers_then_ignores() {
    let tracker = tracker_with(
        TrackerConfig::builder()
            .strategy(StrategyKind::Simple)
            .limit(2)
            .build()
            .unwrap(),
    )
    .await;

    let outcome_1 = tracker
        .track_event("login", "user-1", Some(json!({"ip": "1.2.3.4"})))
        .await
        .unwrap();
    let outcome_2 = tracker
        .track_event("login", "user-1", Some(json!({"ip": "1.2.3.4"})))
        .await
        .unwrap();
    let outcome_3 = tracker
        .track_event("login", "user-1", Some(json!({"ip": "1.2.3.4"})))
        .await
        .unwrap();
    let outcome_4 = tracker
        .track_event("login", "user-1", Some(json!({"ip": "1.2.3.4"})))
        .await
        .unwrap();

    assert_eq!(outcome_1, Outcome::Immediate);
    assert_eq!(outcome_2, Outcome::Immediate);
    assert_eq!(outcome_3, Outcome::Deferred);
    assert!(matches!(outcome_4, Outcome::Ignored(_)));

    tracker.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn distinct_identities_are_tracked_independently() {
    let tracker = tracker_with(TrackerConfig::builder().limit(1).build().unwrap()).await;

    let a1 = tracker.track_event("signup", "a", None).await.unwrap();
    let b1 = tracker.track_event("signup", "b", None).await.unwrap();
    let a2 = tracker.track_event("signup", "a", None).await.unwrap();

    assert_eq!(a1, Outcome::Immediate);
    assert_eq!(b1, Outcome::Immediate);
    assert_eq!(a2, Outcome::Deferred);

    tracker.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn changed_details_reset_the_counter() {
    let tracker = tracker_with(TrackerConfig::builder().limit(1).build().unwrap()).await;

    let first = tracker
        .track_event("payment", "p1", Some(json!({"amount": 10})))
        .await
        .unwrap();
    let second = tracker
        .track_event("payment", "p1", Some(json!({"amount": 10})))
        .await
        .unwrap();
    let third = tracker
        .track_event("payment", "p1", Some(json!({"amount": 99})))
        .await
        .unwrap();

    assert_eq!(first, Outcome::Immediate);
    assert_eq!(second, Outcome::Deferred);
    assert_eq!(third, Outcome::Immediate, "a changed payload starts a fresh record");

    tracker.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn reset_event_clears_tracked_state() {
    let tracker = tracker_with(TrackerConfig::builder().limit(1).build().unwrap()).await;

    tracker.track_event("login", "u", None).await.unwrap();
    assert!(tracker.reset_event("login", "u").await.unwrap());
    assert!(!tracker.reset_event("login", "u").await.unwrap());

    let outcome = tracker.track_event("login", "u", None).await.unwrap();
    assert_eq!(outcome, Outcome::Immediate, "after reset the identity starts fresh");

    tracker.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn key_limit_ignores_new_identities_but_not_existing_ones() {
    let tracker = tracker_with(
        TrackerConfig::builder().limit(10).max_keys(1).build().unwrap(),
    )
    .await;

    let first = tracker.track_event("login", "a", None).await.unwrap();
    let second = tracker.track_event("login", "b", None).await.unwrap();
    let repeat_a = tracker.track_event("login", "a", None).await.unwrap();

    assert_eq!(first, Outcome::Immediate);
    assert_eq!(
        second,
        Outcome::Ignored(event_tracker_core::IgnoredReason::KeyLimitReached)
    );
    assert_eq!(repeat_a, Outcome::Immediate);

    tracker.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn deferred_events_are_delivered_and_removed_by_the_processor() {
    let tracker = tracker_with(
        TrackerConfig::builder()
            .limit(1)
            .defer_interval_ms(0)
            .processing_interval_ms(20)
            .purge_interval_ms(0)
            .build()
            .unwrap(),
    )
    .await;

    let delivered = Arc::new(AtomicUsize::new(0));
    let delivered_for_processor = delivered.clone();
    tracker.set_processor(Arc::new(move |batch| {
        let delivered = delivered_for_processor.clone();
        Box::pin(async move {
            delivered.fetch_add(batch.len(), Ordering::SeqCst);
            Ok(())
        })
    }));

    tracker.track_event("login", "u", None).await.unwrap();
    let outcome = tracker.track_event("login", "u", None).await.unwrap();
    assert_eq!(outcome, Outcome::Deferred);

    // Let the processor's own background loop pick it up on its next tick.
    for _ in 0..50 {
        if delivered.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert!(tracker.deferred_events().await.unwrap().is_empty());

    tracker.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn process_deferred_events_without_a_processor_peeks_without_removing() {
    let tracker = tracker_with(
        TrackerConfig::builder()
            .limit(1)
            .defer_interval_ms(0)
            .purge_interval_ms(0)
            .build()
            .unwrap(),
    )
    .await;

    tracker.track_event("login", "u", None).await.unwrap();
    let outcome = tracker.track_event("login", "u", None).await.unwrap();
    assert_eq!(outcome, Outcome::Deferred);

    let peeked = tracker.process_deferred_events().await.unwrap();
    assert_eq!(peeked.len(), 1);
    assert_eq!(tracker.deferred_events().await.unwrap().len(), 1, "peeking must not remove");

    tracker.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn a_failing_batch_is_retried_whole_and_removed_from_storage_on_final_failure() {
    let tracker = tracker_with(
        TrackerConfig::builder()
            .limit(1)
            .defer_interval_ms(0)
            .processing_interval_ms(1_000_000)
            .purge_interval_ms(0)
            .max_retries(2)
            .retry_delay_ms(1)
            .build()
            .unwrap(),
    )
    .await;

    let mut notifications = tracker.subscribe();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_for_processor = calls.clone();
    tracker.set_processor(Arc::new(move |batch| {
        calls_for_processor.fetch_add(1, Ordering::SeqCst);
        let len = batch.len();
        Box::pin(async move { Err(format!("refusing to deliver {len} records").into()) })
    }));

    tracker.track_event("login", "a", None).await.unwrap();
    tracker.track_event("login", "a", None).await.unwrap();
    tracker.track_event("login", "b", None).await.unwrap();
    tracker.track_event("login", "b", None).await.unwrap();

    // Give `set_processor`'s own spawned task a moment to land before we
    // trigger the cycle by hand.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let attempted = tracker.process_deferred_events().await.unwrap();
    assert_eq!(attempted.len(), 2, "both deferred identities form one batch");

    // One initial attempt plus `max_retries` retries.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(
        tracker.deferred_events().await.unwrap().is_empty(),
        "a failed batch's events are still removed from storage"
    );

    let mut saw_retry = false;
    let mut saw_process_failed = false;
    let mut saw_error = false;
    while let Ok(notification) = notifications.try_recv() {
        match notification {
            Notification::Retry { events, .. } => {
                saw_retry = true;
                assert_eq!(events.len(), 2);
            }
            Notification::ProcessFailed { events, attempts, .. } => {
                saw_process_failed = true;
                assert_eq!(events.len(), 2);
                assert_eq!(attempts, 3);
            }
            Notification::Error { .. } => saw_error = true,
            _ => {}
        }
    }
    assert!(saw_retry, "expected at least one retry notification");
    assert!(saw_process_failed, "expected a process_failed notification");
    assert!(saw_error, "process_failed is followed by an error notification");

    tracker.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn update_config_overlays_one_identity_without_affecting_others() {
    let tracker = tracker_with(TrackerConfig::builder().limit(1).build().unwrap()).await;

    tracker.track_event("login", "a", None).await.unwrap();
    tracker.track_event("login", "b", None).await.unwrap();

    let patch = event_tracker::RecordConfig {
        limit: Some(5),
        ..Default::default()
    };
    assert!(tracker.update_config("login", "a", &patch).await.unwrap());

    // Raising "a"'s own limit to 5 lets it keep admitting; "b" still has
    // the tracker-wide default of 1 and defers on its second event.
    let a2 = tracker.track_event("login", "a", None).await.unwrap();
    let b2 = tracker.track_event("login", "b", None).await.unwrap();
    assert_eq!(a2, Outcome::Immediate);
    assert_eq!(b2, Outcome::Deferred);

    tracker.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn update_config_on_an_unknown_identity_returns_false() {
    let tracker = tracker_with(TrackerConfig::builder().build().unwrap()).await;
    let patch = event_tracker::RecordConfig::default();
    assert!(!tracker.update_config("login", "nobody", &patch).await.unwrap());
    tracker.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn token_bucket_strategy_admits_up_to_bucket_size_then_defers() {
    let tracker = tracker_with(
        TrackerConfig::builder()
            .strategy(StrategyKind::TokenBucket)
            .bucket_size(3.0)
            .refill_rate(1.0)
            .build()
            .unwrap(),
    )
    .await;

    let mut outcomes = Vec::new();
    for _ in 0..4 {
        outcomes.push(tracker.track_event("api", "caller", None).await.unwrap());
    }

    assert_eq!(&outcomes[..3], &[Outcome::Immediate, Outcome::Immediate, Outcome::Immediate]);
    assert_eq!(outcomes[3], Outcome::Deferred);

    tracker.shutdown().await;
}
