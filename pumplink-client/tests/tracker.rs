use std::time::Duration;

use chrono::Utc;
use pumplink_client::tracker::ActivationTracker;
use tokio::time::{sleep, timeout};

#[tokio::test(start_paused = true)]
async fn countdown_runs_to_expiry_and_stops_its_timer() {
    let mut tracker = ActivationTracker::new();
    tracker.set_active_until(Some(Utc::now() + chrono::Duration::milliseconds(89_500)));

    let window = tracker.window();
    assert!(window.is_armed());
    assert!(window.label().starts_with("01:"), "{}", window.label());
    assert_eq!(tracker.active_timers(), 1);

    sleep(Duration::from_secs(30)).await;
    tokio::task::yield_now().await;
    assert_eq!(tracker.window().label(), "00:59");

    sleep(Duration::from_secs(61)).await;
    tokio::task::yield_now().await;
    let window = tracker.window();
    assert!(!window.is_armed());
    assert_eq!(window.label(), "");
    assert_eq!(window.remaining(), Duration::ZERO);
    assert_eq!(window.active_until(), None);
    assert_eq!(tracker.active_timers(), 0);
}

#[tokio::test(start_paused = true)]
async fn past_or_missing_deadline_never_starts_a_timer() {
    let mut tracker = ActivationTracker::new();

    tracker.set_active_until(Some(Utc::now() - chrono::Duration::seconds(5)));
    assert!(!tracker.window().is_armed());
    assert_eq!(tracker.active_timers(), 0);

    tracker.set_active_until(None);
    assert!(!tracker.window().is_armed());
    assert_eq!(tracker.window().label(), "");
    assert_eq!(tracker.active_timers(), 0);
}

#[tokio::test(start_paused = true)]
async fn replacing_the_deadline_leaves_exactly_one_timer() {
    let mut tracker = ActivationTracker::new();
    let now = Utc::now();

    tracker.set_active_until(Some(now + chrono::Duration::minutes(10)));
    tracker.set_active_until(Some(now + chrono::Duration::milliseconds(299_500)));
    sleep(Duration::from_millis(10)).await;
    assert_eq!(tracker.active_timers(), 1);
    assert!(tracker.window().label().starts_with("04:"));

    sleep(Duration::from_secs(2)).await;
    assert!(tracker.window().label().starts_with("04:5"));

    tracker.set_active_until(None);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(tracker.active_timers(), 0);
    assert!(!tracker.window().is_armed());
}

#[tokio::test(start_paused = true)]
async fn subscribers_see_every_tick() {
    let mut tracker = ActivationTracker::new();
    let mut updates = tracker.subscribe();
    tracker.set_active_until(Some(Utc::now() + chrono::Duration::milliseconds(3_500)));
    updates.borrow_and_update();

    let mut labels = Vec::new();
    while updates.changed().await.is_ok() {
        let window = updates.borrow_and_update().clone();
        labels.push(window.label().to_owned());
        if !window.is_armed() {
            break;
        }
    }
    assert_eq!(labels, vec!["00:02", "00:01", "00:00", ""]);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_tracker_cancels_the_countdown() {
    let mut tracker = ActivationTracker::new();
    let mut updates = tracker.subscribe();
    tracker.set_active_until(Some(Utc::now() + chrono::Duration::minutes(30)));
    updates.borrow_and_update();

    drop(tracker);

    let closed = timeout(Duration::from_secs(5), updates.changed())
        .await
        .expect("channel settles once the timer is gone");
    assert!(closed.is_err(), "a dropped tracker must not keep ticking");
}
