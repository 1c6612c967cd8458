mod common;

use chrono::Duration as ChronoDuration;
use common::{drain, Harness};
use reader_api_lib::web::protocol::ServerMessage;
use reader_api_lib::web::state::{Identity, ReaderContext};
use std::time::Duration;
use story_reader_core::achievements::FIRST_STORY;
use story_reader_core::clock::Clock;
use story_reader_core::domain::{PersonalizedStory, ReadingSession, Tier};
use story_reader_core::events::AppState as AppLifecycle;
use story_reader_core::session::CloseReason;
use story_reader_core::tracker::{ScrollGeometry, ScrollOutcome};
use tokio::sync::mpsc;
use uuid::Uuid;

fn at(offset: f64) -> ScrollGeometry {
    ScrollGeometry {
        offset,
        viewport_height: 1000.0,
        content_height: 2000.0,
    }
}

fn context(
    harness: &Harness,
    identity: Identity,
) -> (ReaderContext, mpsc::UnboundedReceiver<ServerMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ReaderContext::new(harness.app.clone(), identity, tx), rx)
}

#[tokio::test(start_paused = true)]
async fn guest_scrolling_past_the_ceiling_hits_the_paywall() {
    let harness = Harness::new();
    let story_id = harness.story();
    let (mut ctx, mut rx) = context(&harness, Identity::guest());
    assert!(ctx.start().await.is_none());

    ctx.open_story(story_id, false).await;
    let outcome = ctx.scroll(at(500.0)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        outcome,
        Some(ScrollOutcome::Clamped {
            progress: 0.30,
            paywall_fired: true
        })
    );
    let messages = drain(&mut rx);
    assert!(matches!(
        &messages[0],
        ServerMessage::StoryOpened { session_id: None, decision, .. } if decision.max_progress_allowed == 0.30
    ));
    assert!(messages
        .iter()
        .any(|m| matches!(m, ServerMessage::Paywall { .. })));
    assert!(messages
        .iter()
        .any(|m| matches!(m, ServerMessage::ScrollTo { offset } if (*offset - 300.0).abs() < 1e-6)));
    assert!(harness.store.sessions().is_empty());

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn finishing_a_story_closes_the_session_and_unlocks_an_achievement() {
    let harness = Harness::new();
    let story_id = harness.story();
    let (user_id, identity) = harness.identity(Tier::Premium);
    let (mut ctx, mut rx) = context(&harness, identity);
    ctx.start().await;

    ctx.open_story(story_id, false).await;
    harness.clock.advance(ChronoDuration::seconds(12));
    ctx.scroll(at(1000.0)).await;
    ctx.close_story(CloseReason::Unmount).await;

    let messages = drain(&mut rx);
    assert!(messages.iter().any(|m| matches!(
        m,
        ServerMessage::SessionClosed {
            duration_seconds: 12,
            completed: true,
            ..
        }
    )));
    assert!(messages.iter().any(|m| matches!(
        m,
        ServerMessage::AchievementUnlocked { achievement_id, .. } if achievement_id == FIRST_STORY
    )));
    assert_eq!(harness.store.progress(user_id, story_id), Some(1.0));
    assert!(harness.store.user(user_id).unwrap().last_seen_at.is_some());

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn backgrounding_closes_the_session_and_foregrounding_reopens_it() {
    let harness = Harness::new();
    let story_id = harness.story();
    let (user_id, identity) = harness.identity(Tier::Free);
    let (mut ctx, mut rx) = context(&harness, identity);
    let mut closures = ctx.start().await.unwrap();

    ctx.open_story(story_id, false).await;
    harness.clock.advance(ChronoDuration::seconds(42));
    ctx.app_state(AppLifecycle::Background).await;

    let closed = closures.recv().await.unwrap();
    assert_eq!(closed.duration_seconds, 42);
    ctx.session_closed(closed).await;

    ctx.app_state(AppLifecycle::Active).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let sessions = harness.store.sessions();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions.iter().filter(|s| s.is_open()).count(), 1);
    assert!(sessions.iter().all(|s| s.user_id == user_id));

    let messages = drain(&mut rx);
    assert!(messages.iter().any(|m| matches!(
        m,
        ServerMessage::LimitsRefreshed { limits: Some(limits) } if limits.max_story_progress == 0.5
    )));

    ctx.shutdown().await;
    assert!(harness.store.sessions().iter().all(|s| !s.is_open()));
}

#[tokio::test(start_paused = true)]
async fn last_seen_moves_only_when_progress_is_saved() {
    let harness = Harness::new();
    let story_id = harness.story();
    let (user_id, identity) = harness.identity(Tier::Premium);
    let (mut ctx, _rx) = context(&harness, identity);
    ctx.start().await;
    ctx.open_story(story_id, false).await;

    ctx.scroll(at(400.0)).await;
    let first_seen = harness.store.user(user_id).unwrap().last_seen_at;
    assert!(first_seen.is_some());

    harness.clock.advance(ChronoDuration::minutes(3));
    ctx.scroll(at(400.0)).await;
    assert_eq!(harness.store.user(user_id).unwrap().last_seen_at, first_seen);

    ctx.scroll(at(800.0)).await;
    assert_eq!(
        harness.store.user(user_id).unwrap().last_seen_at,
        Some(harness.clock.now())
    );

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn dependency_and_locale_changes_refresh_limits() {
    let harness = Harness::new();
    let (_, identity) = harness.identity(Tier::Free);
    let (mut ctx, mut rx) = context(&harness, identity);
    ctx.start().await;

    ctx.dependencies_changed();
    tokio::time::sleep(Duration::from_secs(6)).await;
    ctx.locale_changed("de-DE".to_string());
    tokio::time::sleep(Duration::from_secs(1)).await;

    let refreshed = drain(&mut rx)
        .into_iter()
        .filter(|m| matches!(m, ServerMessage::LimitsRefreshed { limits: Some(_) }))
        .count();
    assert_eq!(refreshed, 2);

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn upgrading_takes_effect_after_the_foreground_refresh() {
    let harness = Harness::new();
    let story_id = harness.story();
    let (user_id, identity) = harness.identity(Tier::Free);
    let (mut ctx, _rx) = context(&harness, identity);
    ctx.start().await;
    ctx.open_story(story_id, false).await;

    assert!(matches!(
        ctx.scroll(at(1000.0)).await,
        Some(ScrollOutcome::Clamped { progress, .. }) if progress == 0.5
    ));

    harness.store.set_tier(user_id, Tier::Premium);
    ctx.app_state(AppLifecycle::Background).await;
    ctx.app_state(AppLifecycle::Active).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(
        ctx.scroll(at(1000.0)).await,
        Some(ScrollOutcome::Accepted { progress: 1.0 })
    );

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn abandoned_sessions_are_reconciled_on_connect() {
    let harness = Harness::new();
    let (user_id, identity) = harness.identity(Tier::Free);
    let started_at = harness.clock.now() - ChronoDuration::hours(5);
    harness.store.insert_session(ReadingSession {
        id: Uuid::new_v4(),
        user_id,
        story_id: Uuid::new_v4(),
        is_personalized: false,
        started_at,
        ended_at: None,
        duration_seconds: 0,
        completed: false,
    });

    let (mut ctx, _rx) = context(&harness, identity);
    ctx.start().await;

    let sessions = harness.store.sessions();
    assert!(!sessions[0].is_open());
    assert_eq!(sessions[0].duration_seconds, 0);
    assert!(!sessions[0].completed);

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn other_users_personalized_stories_are_not_found() {
    let harness = Harness::new();
    let (owner_id, _) = harness.identity(Tier::Free);
    let story_id = Uuid::new_v4();
    harness
        .store
        .add_personalized_story(PersonalizedStory {
            id: story_id,
            owner_id,
        });
    let (_, stranger) = harness.identity(Tier::Free);
    let (mut ctx, mut rx) = context(&harness, stranger);

    ctx.open_story(story_id, true).await;

    assert!(ctx.view.is_none());
    assert!(matches!(
        drain(&mut rx).as_slice(),
        [ServerMessage::Error { message }] if message == "Story not found."
    ));
}
