//! Shared wiring for the service tests: in-memory ports, a manual clock and
//! helpers to seed users with a login session.

#![allow(dead_code)]

use chrono::{Duration, TimeZone, Utc};
use reader_api_lib::adapters::auth::MemoryAuthSessions;
use reader_api_lib::config::Config;
use reader_api_lib::web::protocol::ServerMessage;
use reader_api_lib::web::state::{AppState, Identity};
use std::sync::Arc;
use story_reader_core::clock::{Clock, ManualClock};
use story_reader_core::domain::{AuthSession, Caller, Story, Tier};
use story_reader_core::memory::MemoryStore;
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub auth: Arc<MemoryAuthSessions>,
    pub clock: Arc<ManualClock>,
    pub app: Arc<AppState>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let auth = Arc::new(MemoryAuthSessions::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap(),
        ));
        let config = Config::from_lookup(|key| match key {
            "DATABASE_URL" => Some("postgres://localhost/reader_test".to_string()),
            _ => None,
        })
        .unwrap();
        let app = Arc::new(AppState::new(
            store.clone(),
            store.clone(),
            store.clone(),
            auth.clone(),
            Arc::new(config),
            clock.clone(),
        ));
        Self {
            store,
            auth,
            clock,
            app,
        }
    }

    /// Adds a user with a live login session; returns the user id and its cookie token.
    pub fn sign_in(&self, tier: Tier) -> (Uuid, String) {
        let user_id = self.store.add_user_with_tier(tier);
        let token = format!("token-{}", user_id);
        self.auth.insert(AuthSession {
            id: token.clone(),
            user_id,
            expires_at: self.clock.now() + Duration::days(1),
        });
        (user_id, token)
    }

    pub fn identity(&self, tier: Tier) -> (Uuid, Identity) {
        let (user_id, token) = self.sign_in(tier);
        (
            user_id,
            Identity {
                caller: Caller::User(user_id),
                token: Some(token),
            },
        )
    }

    pub fn story(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.store.add_story(Story {
            id,
            is_daily_free: false,
            content_length: 4000,
        });
        id
    }
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}
