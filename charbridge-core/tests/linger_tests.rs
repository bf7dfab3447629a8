// ABOUTME: Integration tests for lingering windows after multi-party replies
// ABOUTME: Runs on paused tokio time so the decaying acceptance window is deterministic

mod common;

use charbridge_core::config::Config;
use charbridge_core::dispatch::{DispatchQueue, Job};
use charbridge_core::format::MessageTemplate;
use charbridge_core::linger::{Dropoff, LingerController, LingerCurve, LingerWindow};
use charbridge_core::{ChatUser, IncomingMessage, Surface};
use common::*;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn linger_config() -> Config {
    let mut config = test_config();
    config.lingering.chance = 100.0;
    config.lingering.timeout_secs = 10.0;
    config.lingering.exponent_curve = 2.25;
    config.lingering.dropoff = Dropoff::Plateau;
    config
}

/// Submit a trigger from alice in g1/c1 and wait for the reply
async fn triggered(config: Config) -> Harness {
    let h = start(config);
    h.bridge.submit(guild_msg("m1", alice(), "hello")).await.unwrap();
    h.platform.wait_for_sent(1).await;
    h
}

async fn after(secs: f64) {
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
}

#[tokio::test(start_paused = true)]
async fn test_follow_up_at_five_seconds_is_captured() {
    let h = triggered(linger_config()).await;
    assert_eq!(h.bridge.lingering_windows(), 1);

    after(5.0).await;
    h.bridge.observe(&guild_msg("m2", alice(), "and another thing"));
    let sent = h.platform.wait_for_sent(2).await;

    let sends = h.backend.sends();
    assert_eq!(sends.len(), 2);
    assert_eq!(sends[1].1, "alice: and another thing");
    // Captured follow-ups stay in the originating session
    assert_eq!(sends[0].0, sends[1].0);
    assert_eq!(sent[1].message.reply_to.as_deref(), Some("m2"));
}

#[tokio::test(start_paused = true)]
async fn test_follow_up_near_timeout_is_rejected() {
    let h = triggered(linger_config()).await;

    after(9.5).await;
    h.bridge.observe(&guild_msg("m2", alice(), "still there?"));
    settle().await;

    assert_eq!(h.backend.sends().len(), 1);
    assert_eq!(h.platform.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_qualifying_messages_are_ignored() {
    let h = triggered(linger_config()).await;
    after(1.0).await;

    let bob = ChatUser::new("u-bob", "bob");
    h.bridge.observe(&guild_msg("m2", bob, "me too"));
    h.bridge.observe(&IncomingMessage::new(
        "m3",
        Surface::guild("g1"),
        "c2",
        alice(),
        "other channel",
    ));
    h.bridge.observe(&guild_msg("m4", alice(), "   "));
    h.bridge
        .observe(&guild_msg("m5", alice(), "hey bot").mentioning_bot());
    settle().await;

    assert_eq!(h.backend.sends().len(), 1);
    // The window is still open for a qualifying message
    h.bridge.observe(&guild_msg("m6", alice(), "right, so"));
    h.platform.wait_for_sent(2).await;
}

#[tokio::test(start_paused = true)]
async fn test_window_expires_after_timeout() {
    let h = triggered(linger_config()).await;

    after(11.0).await;
    assert_eq!(h.bridge.lingering_windows(), 0);

    h.bridge.observe(&guild_msg("m2", alice(), "too late"));
    settle().await;
    assert_eq!(h.backend.sends().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_captured_message_is_not_duplicated_by_submit() {
    let h = triggered(linger_config()).await;
    after(1.0).await;

    // The host both shows the message to observers and submits it
    let follow_up = guild_msg("m2", alice(), "both paths");
    h.bridge.observe(&follow_up);
    tokio::task::yield_now().await;
    h.bridge.submit(follow_up).await.unwrap();

    h.platform.wait_for_sent(2).await;
    settle().await;
    assert_eq!(h.backend.sends().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disable_cancels_open_windows() {
    let h = triggered(linger_config()).await;
    assert_eq!(h.bridge.lingering_windows(), 1);

    h.bridge.disable();
    assert_eq!(h.bridge.lingering_windows(), 0);

    after(1.0).await;
    h.bridge.observe(&guild_msg("m2", alice(), "anyone?"));
    settle().await;
    assert_eq!(h.backend.sends().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_private_surfaces_do_not_linger() {
    let h = start(linger_config());
    h.bridge.submit(dm_msg("m1", alice(), "hello")).await.unwrap();
    h.platform.wait_for_sent(1).await;

    assert_eq!(h.bridge.lingering_windows(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_lingering_can_be_switched_off() {
    let mut config = linger_config();
    config.lingering.enabled = false;
    let h = triggered(config).await;
    assert_eq!(h.bridge.lingering_windows(), 0);

    after(1.0).await;
    h.bridge.observe(&guild_msg("m2", alice(), "hello?"));
    settle().await;
    assert_eq!(h.backend.sends().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_one_window_captures_twice_then_expires_on_schedule() {
    let curve = LingerCurve::from_config(&linger_config().lingering);
    let trigger = guild_msg("m1", alice(), "hello");
    let window = LingerWindow::open(&trigger, "sess-1", curve);
    let opened = Instant::now();

    let (queue, mut jobs) = DispatchQueue::new();
    let (events, rx) = broadcast::channel(16);
    let controller = LingerController::new(window, rx, queue, MessageTemplate::default());
    let token = CancellationToken::new();
    let handle = tokio::spawn(controller.run(token.clone()));

    after(2.0).await;
    events.send(guild_msg("m2", alice(), "two")).unwrap();
    after(2.0).await;
    events.send(guild_msg("m3", alice(), "four")).unwrap();

    for (id, text) in [("m2", "alice: two"), ("m3", "alice: four")] {
        match jobs.recv().await {
            Some(Job::Deliver(item)) => {
                assert_eq!(item.source_message_id, id);
                assert_eq!(item.session_id, "sess-1");
                assert_eq!(item.text, text);
            }
            _ => panic!("expected a captured delivery for {}", id),
        }
    }

    // Captures do not extend the window: it still ends 10 s after the trigger
    let captured = handle.await.unwrap();
    let lifetime = opened.elapsed();
    assert_eq!(captured, 2);
    assert!(lifetime >= Duration::from_millis(9_900), "ended early: {:?}", lifetime);
    assert!(lifetime <= Duration::from_millis(10_100), "ended late: {:?}", lifetime);
    assert!(token.is_cancelled());
}

