//! crates/story_reader_core/src/memory.rs
//!
//! An in-memory implementation of the persistence, entitlement and schedule ports.
//! Reads always observe prior writes, and achievement grants honor the
//! `(user_id, achievement_id)` uniqueness the real store enforces.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::domain::{
    AchievementGrant, PersonalizedStory, ReadingSession, SessionClosure, Story, Tier,
    UsageCounters, User,
};
use crate::ports::{
    DailyStoryService, DatabaseService, EntitlementOracle, PortError, PortResult,
};

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    counters: HashMap<Uuid, UsageCounters>,
    stories: HashMap<Uuid, Story>,
    personalized: HashMap<Uuid, PersonalizedStory>,
    progress: HashMap<(Uuid, Uuid), f64>,
    progress_writes: usize,
    sessions: Vec<ReadingSession>,
    grants: HashMap<(Uuid, String), AchievementGrant>,
    daily_schedule: HashMap<NaiveDate, Uuid>,
}

#[derive(Default)]
struct Failures {
    entitlements: bool,
    daily_schedule: bool,
    progress_writes: bool,
    session_writes: u32,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    failures: Mutex<Failures>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn failures(&self) -> MutexGuard<'_, Failures> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- Seeding ---

    pub fn add_user(&self, user: User) {
        self.state().users.insert(user.user_id, user);
    }

    /// Adds a user with default locale settings and returns its id.
    pub fn add_user_with_tier(&self, tier: Tier) -> Uuid {
        let user_id = Uuid::new_v4();
        self.add_user(User {
            user_id,
            tier,
            language: "en".to_string(),
            utc_offset_minutes: 0,
            last_seen_at: None,
        });
        user_id
    }

    pub fn set_tier(&self, user_id: Uuid, tier: Tier) {
        if let Some(user) = self.state().users.get_mut(&user_id) {
            user.tier = tier;
        }
    }

    pub fn set_usage_counters(&self, user_id: Uuid, counters: UsageCounters) {
        self.state().counters.insert(user_id, counters);
    }

    pub fn add_story(&self, story: Story) {
        self.state().stories.insert(story.id, story);
    }

    pub fn add_personalized_story(&self, story: PersonalizedStory) {
        self.state().personalized.insert(story.id, story);
    }

    pub fn schedule_daily_story(&self, date: NaiveDate, story_id: Uuid) {
        self.state().daily_schedule.insert(date, story_id);
    }

    /// Inserts a session record as-is, bypassing the session manager.
    pub fn insert_session(&self, session: ReadingSession) {
        self.state().sessions.push(session);
    }

    // --- Failure switches ---

    pub fn fail_entitlements(&self, fail: bool) {
        self.failures().entitlements = fail;
    }

    pub fn fail_daily_schedule(&self, fail: bool) {
        self.failures().daily_schedule = fail;
    }

    pub fn fail_progress_writes(&self, fail: bool) {
        self.failures().progress_writes = fail;
    }

    /// The next `count` session writes (create or close) fail.
    pub fn fail_next_session_writes(&self, count: u32) {
        self.failures().session_writes = count;
    }

    fn take_session_write_failure(&self) -> bool {
        let mut failures = self.failures();
        if failures.session_writes > 0 {
            failures.session_writes -= 1;
            true
        } else {
            false
        }
    }

    // --- Inspection ---

    pub fn progress(&self, user_id: Uuid, story_id: Uuid) -> Option<f64> {
        self.state().progress.get(&(user_id, story_id)).copied()
    }

    pub fn progress_writes(&self) -> usize {
        self.state().progress_writes
    }

    pub fn sessions(&self) -> Vec<ReadingSession> {
        self.state().sessions.clone()
    }

    pub fn grant_count(&self, user_id: Uuid) -> usize {
        self.state()
            .grants
            .keys()
            .filter(|(owner, _)| *owner == user_id)
            .count()
    }

    pub fn user(&self, user_id: Uuid) -> Option<User> {
        self.state().users.get(&user_id).cloned()
    }
}

#[async_trait]
impl DatabaseService for MemoryStore {
    async fn get_user(&self, user_id: Uuid) -> PortResult<User> {
        self.state()
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("User {} not found", user_id)))
    }

    async fn touch_last_seen(&self, user_id: Uuid, at: DateTime<Utc>) -> PortResult<()> {
        let mut state = self.state();
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| PortError::NotFound(format!("User {} not found", user_id)))?;
        user.last_seen_at = Some(at);
        Ok(())
    }

    async fn get_usage_counters(&self, user_id: Uuid) -> PortResult<UsageCounters> {
        if self.failures().entitlements {
            return Err(PortError::Unexpected("usage store offline".to_string()));
        }
        Ok(self
            .state()
            .counters
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_story(&self, story_id: Uuid) -> PortResult<Story> {
        self.state()
            .stories
            .get(&story_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Story {} not found", story_id)))
    }

    async fn get_personalized_story(&self, story_id: Uuid) -> PortResult<PersonalizedStory> {
        self.state()
            .personalized
            .get(&story_id)
            .cloned()
            .ok_or_else(|| {
                PortError::NotFound(format!("Personalized story {} not found", story_id))
            })
    }

    async fn get_story_progress(&self, user_id: Uuid, story_id: Uuid) -> PortResult<Option<f64>> {
        Ok(self.progress(user_id, story_id))
    }

    async fn save_story_progress(
        &self,
        user_id: Uuid,
        story_id: Uuid,
        progress: f64,
    ) -> PortResult<()> {
        if self.failures().progress_writes {
            return Err(PortError::Unexpected("progress store offline".to_string()));
        }
        let mut state = self.state();
        state.progress.insert((user_id, story_id), progress);
        state.progress_writes += 1;
        Ok(())
    }

    async fn create_reading_session(&self, session: ReadingSession) -> PortResult<()> {
        if self.take_session_write_failure() {
            return Err(PortError::Unexpected("session store offline".to_string()));
        }
        self.state().sessions.push(session);
        Ok(())
    }

    async fn close_reading_session(
        &self,
        session_id: Uuid,
        closure: SessionClosure,
    ) -> PortResult<bool> {
        if self.take_session_write_failure() {
            return Err(PortError::Unexpected("session store offline".to_string()));
        }
        let mut state = self.state();
        let session = match state
            .sessions
            .iter_mut()
            .find(|s| s.id == session_id && s.is_open())
        {
            Some(session) => session,
            None => return Ok(false),
        };
        session.ended_at = Some(closure.ended_at);
        session.duration_seconds = closure.duration_seconds;
        session.completed = closure.completed;
        Ok(true)
    }

    async fn get_open_sessions(&self, user_id: Uuid) -> PortResult<Vec<ReadingSession>> {
        Ok(self
            .state()
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id && s.is_open())
            .cloned()
            .collect())
    }

    async fn get_sessions_by_user(&self, user_id: Uuid) -> PortResult<Vec<ReadingSession>> {
        Ok(self
            .state()
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn get_achievement_grant(
        &self,
        user_id: Uuid,
        achievement_id: &str,
    ) -> PortResult<Option<AchievementGrant>> {
        Ok(self
            .state()
            .grants
            .get(&(user_id, achievement_id.to_string()))
            .cloned())
    }

    async fn insert_achievement_grant(&self, grant: AchievementGrant) -> PortResult<()> {
        let mut state = self.state();
        let key = (grant.user_id, grant.achievement_id.clone());
        if state.grants.contains_key(&key) {
            return Err(PortError::Conflict(format!(
                "Achievement {} already granted to {}",
                grant.achievement_id, grant.user_id
            )));
        }
        state.grants.insert(key, grant);
        Ok(())
    }

    async fn get_achievement_grants(&self, user_id: Uuid) -> PortResult<Vec<AchievementGrant>> {
        let mut grants: Vec<_> = self
            .state()
            .grants
            .values()
            .filter(|g| g.user_id == user_id)
            .cloned()
            .collect();
        grants.sort_by_key(|g| g.unlocked_at);
        Ok(grants)
    }
}

#[async_trait]
impl EntitlementOracle for MemoryStore {
    async fn resolve_tier(&self, user_id: Uuid) -> PortResult<Tier> {
        if self.failures().entitlements {
            return Err(PortError::Unexpected("billing oracle offline".to_string()));
        }
        self.state()
            .users
            .get(&user_id)
            .map(|u| u.tier)
            .ok_or_else(|| PortError::NotFound(format!("User {} not found", user_id)))
    }
}

#[async_trait]
impl DailyStoryService for MemoryStore {
    async fn daily_free_story_id(&self, date: NaiveDate) -> PortResult<Option<Uuid>> {
        if self.failures().daily_schedule {
            return Err(PortError::Unexpected("schedule offline".to_string()));
        }
        Ok(self.state().daily_schedule.get(&date).copied())
    }
}
