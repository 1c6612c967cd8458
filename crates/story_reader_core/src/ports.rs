//! crates/story_reader_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the reading engine.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of the persistence store, the billing oracle and the auth provider.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::domain::{
    AchievementGrant, AuthSession, PersonalizedStory, ReadingSession, SessionClosure, Story, Tier,
    UsageCounters, User,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    /// A uniqueness constraint rejected the write.
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Unauthorized")]
    Unauthorized,
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

#[async_trait]
pub trait DatabaseService: Send + Sync {
    // --- Users ---
    async fn get_user(&self, user_id: Uuid) -> PortResult<User>;

    async fn touch_last_seen(&self, user_id: Uuid, at: DateTime<Utc>) -> PortResult<()>;

    async fn get_usage_counters(&self, user_id: Uuid) -> PortResult<UsageCounters>;

    // --- Stories ---
    async fn get_story(&self, story_id: Uuid) -> PortResult<Story>;

    async fn get_personalized_story(&self, story_id: Uuid) -> PortResult<PersonalizedStory>;

    // --- Story Progress ---
    /// Returns `None` when the user has never read the story.
    async fn get_story_progress(&self, user_id: Uuid, story_id: Uuid) -> PortResult<Option<f64>>;

    async fn save_story_progress(
        &self,
        user_id: Uuid,
        story_id: Uuid,
        progress: f64,
    ) -> PortResult<()>;

    // --- Reading Sessions ---
    async fn create_reading_session(&self, session: ReadingSession) -> PortResult<()>;

    /// Stamps the closure on a session that is still open. Returns `false` when no
    /// open session matched, i.e. someone else already closed it.
    async fn close_reading_session(
        &self,
        session_id: Uuid,
        closure: SessionClosure,
    ) -> PortResult<bool>;

    async fn get_open_sessions(&self, user_id: Uuid) -> PortResult<Vec<ReadingSession>>;

    async fn get_sessions_by_user(&self, user_id: Uuid) -> PortResult<Vec<ReadingSession>>;

    // --- Achievements ---
    async fn get_achievement_grant(
        &self,
        user_id: Uuid,
        achievement_id: &str,
    ) -> PortResult<Option<AchievementGrant>>;

    /// Must fail with `PortError::Conflict` when `(user_id, achievement_id)` already exists.
    async fn insert_achievement_grant(&self, grant: AchievementGrant) -> PortResult<()>;

    async fn get_achievement_grants(&self, user_id: Uuid) -> PortResult<Vec<AchievementGrant>>;
}

/// The billing/subscription system, treated as an opaque tier oracle.
#[async_trait]
pub trait EntitlementOracle: Send + Sync {
    async fn resolve_tier(&self, user_id: Uuid) -> PortResult<Tier>;
}

/// The external schedule that picks one free story per day.
#[async_trait]
pub trait DailyStoryService: Send + Sync {
    async fn daily_free_story_id(&self, date: NaiveDate) -> PortResult<Option<Uuid>>;
}

/// The auth provider, scoped to one client's credentials.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn get_session(&self) -> PortResult<Option<AuthSession>>;

    async fn refresh_session(&self) -> PortResult<AuthSession>;

    async fn current_user_id(&self) -> PortResult<Option<Uuid>>;
}

/// The UI layer's inbound signals for a single story view.
pub trait ViewSink: Send + Sync {
    fn progress(&self, fraction: f64);

    fn paywall(&self, message: &str);

    fn scroll_to(&self, offset: f64);
}
