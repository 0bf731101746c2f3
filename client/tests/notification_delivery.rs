//! End-to-end delivery through the connection manager: fetch, store,
//! display and acknowledge, observed from the display channel and the fake API.

mod helpers;

use std::time::Duration;

use helpers::fakes::{notification, Harness, HarnessBuilder};
use pushdesk_lib::connection::state::ConnectionState;
use pushdesk_lib::delivery::pipeline::{
    DisplayItem, PipelineConfig, DISPLAY_INTERVAL, MAX_DISPLAY_LIMIT,
};
use pushdesk_lib::protocol::error::ApiError;
use pushdesk_lib::protocol::model::Notification;
use pushdesk_lib::protocol::socket::SocketEvent;
use pushdesk_lib::test_utils::assert_eventually;
use tokio::sync::broadcast;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(60);

fn immediate() -> PipelineConfig {
    PipelineConfig {
        native_notifications: false,
        ..PipelineConfig::default()
    }
}

async fn next_item(displays: &mut broadcast::Receiver<DisplayItem>) -> DisplayItem {
    tokio::time::timeout(WAIT, displays.recv())
        .await
        .expect("timed out waiting for a display item")
        .expect("display channel closed")
}

/// Wait long enough for any further display to surface, then assert there was none
async fn assert_no_more_items(displays: &mut broadcast::Receiver<DisplayItem>) {
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(
        matches!(displays.try_recv(), Err(broadcast::error::TryRecvError::Empty)),
        "unexpected extra display item"
    );
}

async fn wait_for_acks(harness: &Harness, count: usize) -> Vec<u64> {
    let api = harness.api.clone();
    assert_eventually(
        &format!("{} acknowledgments", count),
        WAIT,
        Duration::from_millis(10),
        || {
            let api = api.clone();
            async move {
                let acks = api.acks();
                if acks.len() >= count {
                    Ok(acks)
                } else {
                    Err(format!("only {:?}", acks))
                }
            }
        },
    )
    .await
}

fn with_sound(mut n: Notification, sound: &str) -> Notification {
    n.sound_key = Some(sound.to_string());
    n
}

#[tokio::test(start_paused = true)]
async fn test_batch_acknowledged_once_with_last_local_id() {
    let harness = HarnessBuilder::default().config(immediate()).spawn();
    harness.api.push_fetch(Ok(vec![
        notification(5, 500),
        notification(9, 501),
        notification(7, 502),
    ]));
    let mut displays = harness.handle.subscribe_displays();

    harness.handle.start();

    let acks = wait_for_acks(&harness, 1).await;
    assert_eq!(acks, vec![7]);

    let ids: Vec<_> = [
        next_item(&mut displays).await,
        next_item(&mut displays).await,
        next_item(&mut displays).await,
    ]
    .iter()
    .map(|item| item.global_id)
    .collect();
    assert_eq!(ids, vec![Some(500), Some(501), Some(502)]);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(harness.api.acks(), vec![7]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_ack_is_superseded_by_next_batch() {
    let harness = HarnessBuilder::default().config(immediate()).spawn();
    harness
        .api
        .push_fetch(Ok(vec![notification(1, 10), notification(2, 11)]));
    harness
        .api
        .push_fetch(Ok(vec![notification(3, 12), notification(4, 13)]));
    harness
        .api
        .push_ack(Err(ApiError::Rejected("server unavailable (503)".to_string())));

    harness.handle.start();
    assert_eq!(wait_for_acks(&harness, 1).await, vec![2]);

    // Give the failed ack time to surface before the next signal
    tokio::time::sleep(Duration::from_secs(5)).await;
    let status = harness.handle.status();
    assert_eq!(status.state, ConnectionState::Online);
    assert!(!status.max_failures_exceeded);

    harness.connector.emit(SocketEvent::Notification);
    assert_eq!(wait_for_acks(&harness, 2).await, vec![2, 4]);

    let status = harness.handle.status();
    assert_eq!(status.state, ConnectionState::Online);
    assert!(!status.max_failures_exceeded);
    assert_eq!(status.messages_received, 4);
    assert_eq!(harness.connector.connections(), 1);
    assert_eq!(harness.connector.disconnects(), 0);
    assert_eq!(harness.credential_store.clears(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_empty_batch_is_not_acknowledged() {
    let harness = HarnessBuilder::default().config(immediate()).spawn();
    harness.handle.start();

    let api = harness.api.clone();
    assert_eventually("first fetch", WAIT, Duration::from_millis(10), || {
        let api = api.clone();
        async move {
            if api.fetches() >= 1 {
                Ok(())
            } else {
                Err("no fetch yet")
            }
        }
    })
    .await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(harness.api.acks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_suppressed_priority_is_stored_not_displayed() {
    let harness = HarnessBuilder::default().config(immediate()).spawn();
    let mut hidden = notification(1, 10);
    hidden.priority = -2;
    harness.api.push_fetch(Ok(vec![hidden]));
    let mut displays = harness.handle.subscribe_displays();

    harness.handle.start();

    assert_eq!(wait_for_acks(&harness, 1).await, vec![1]);
    assert_eq!(harness.handle.status().messages_received, 1);
    assert_no_more_items(&mut displays).await;
}

#[tokio::test(start_paused = true)]
async fn test_redelivered_notification_displays_again() {
    let harness = HarnessBuilder::default().config(immediate()).spawn();
    harness.api.push_fetch(Ok(vec![notification(1, 42)]));
    harness.api.push_fetch(Ok(vec![notification(2, 42)]));
    let mut displays = harness.handle.subscribe_displays();

    harness.handle.start();
    assert_eq!(next_item(&mut displays).await.global_id, Some(42));

    harness.connector.emit(SocketEvent::Notification);
    assert_eq!(next_item(&mut displays).await.global_id, Some(42));

    assert_eq!(harness.handle.status().messages_received, 1);
    assert_eq!(wait_for_acks(&harness, 2).await, vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_overflow_displays_most_recent_and_summary() {
    let config = PipelineConfig {
        max_notification_amount: 3,
        ..immediate()
    };
    let harness = HarnessBuilder::default().config(config).spawn();
    let batch: Vec<_> = (1..=10).map(|i| notification(i, 1000 + i)).collect();
    harness.api.push_fetch(Ok(batch));
    let mut displays = harness.handle.subscribe_displays();

    harness.handle.start();

    let mut shown = Vec::new();
    for _ in 0..4 {
        shown.push(next_item(&mut displays).await);
    }
    assert_no_more_items(&mut displays).await;

    let ids: Vec<_> = shown.iter().map(|item| item.global_id).collect();
    assert_eq!(ids, vec![Some(1008), Some(1009), Some(1010), None]);
    assert!(shown[3].is_summary());
    assert_eq!(shown[3].body, "Omitted 7 older notifications");

    assert_eq!(harness.handle.status().messages_received, 10);
    assert_eq!(wait_for_acks(&harness, 1).await, vec![10]);
}

#[tokio::test(start_paused = true)]
async fn test_large_unthrottled_batch_reaches_subscriber_without_lag() {
    let config = PipelineConfig {
        max_notification_amount: 10_000,
        ..immediate()
    };
    let harness = HarnessBuilder::default().config(config).spawn();
    harness
        .api
        .push_fetch(Ok((1..=300).map(|i| notification(i, i)).collect()));
    let mut displays = harness.handle.subscribe_displays();

    harness.handle.start();

    let first = next_item(&mut displays).await;
    assert_eq!(first.global_id, Some(201));
    for _ in 1..MAX_DISPLAY_LIMIT {
        assert!(!next_item(&mut displays).await.is_summary());
    }
    let summary = next_item(&mut displays).await;
    assert_eq!(summary.body, "Omitted 200 older notifications");
    assert_no_more_items(&mut displays).await;
    assert_eq!(harness.handle.status().messages_received, 300);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_sound_in_cooldown_is_silenced() {
    let harness = HarnessBuilder::default().config(immediate()).spawn();
    harness.api.push_fetch(Ok(vec![
        with_sound(notification(1, 1), "si"),
        with_sound(notification(2, 2), "si"),
        with_sound(notification(3, 3), "no"),
    ]));
    let mut displays = harness.handle.subscribe_displays();

    harness.handle.start();

    let first = next_item(&mut displays).await;
    let second = next_item(&mut displays).await;
    let third = next_item(&mut displays).await;
    assert_eq!(first.sound.as_deref(), Some("si"));
    assert_eq!(second.sound, None);
    assert_eq!(third.sound, None);
}

#[tokio::test(start_paused = true)]
async fn test_native_display_is_spaced_and_complete() {
    let harness = HarnessBuilder::default()
        .config(PipelineConfig::default())
        .spawn();
    harness
        .api
        .push_fetch(Ok((1..=4).map(|i| notification(i, i)).collect()));
    let mut displays = harness.handle.subscribe_displays();

    harness.handle.start();

    let mut arrivals = Vec::new();
    for expected in 1..=4 {
        let item = next_item(&mut displays).await;
        assert_eq!(item.global_id, Some(expected));
        arrivals.push(Instant::now());
    }

    for pair in arrivals.windows(2) {
        assert!(pair[1] - pair[0] >= DISPLAY_INTERVAL);
    }
}

#[tokio::test(start_paused = true)]
async fn test_stop_drops_queued_displays() {
    let harness = HarnessBuilder::default()
        .config(PipelineConfig::default())
        .spawn();
    harness
        .api
        .push_fetch(Ok((1..=5).map(|i| notification(i, i)).collect()));
    let mut displays = harness.handle.subscribe_displays();

    harness.handle.start();
    assert_eq!(next_item(&mut displays).await.global_id, Some(1));

    harness.handle.stop();
    let mut status = harness.handle.subscribe_status();
    status
        .wait_for(|s| s.state == ConnectionState::Stopped)
        .await
        .unwrap();

    assert_no_more_items(&mut displays).await;
}

#[tokio::test(start_paused = true)]
async fn test_config_change_applies_to_next_batch() {
    let harness = HarnessBuilder::default().config(immediate()).spawn();
    harness.api.push_fetch(Ok(vec![notification(1, 1)]));
    harness.api.push_fetch(Ok(vec![notification(2, 2)]));
    let mut displays = harness.handle.subscribe_displays();

    harness.handle.start();
    assert_eq!(next_item(&mut displays).await.sound.as_deref(), Some("po"));

    harness.handle.update_config(PipelineConfig {
        default_sound: "bk".to_string(),
        ..immediate()
    });
    harness.connector.emit(SocketEvent::Notification);
    assert_eq!(next_item(&mut displays).await.sound.as_deref(), Some("bk"));
}
