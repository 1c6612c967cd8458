//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, the concrete implementation of the
//! persistence, entitlement and schedule ports from the core crate. It handles all
//! interactions with the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool};
use story_reader_core::domain::{
    AchievementGrant, AuthSession, PersonalizedStory, ReadingSession, SessionClosure, Story, Tier,
    UsageCounters, User,
};
use story_reader_core::ports::{
    DailyStoryService, DatabaseService, EntitlementOracle, PortError, PortResult,
};
use uuid::Uuid;

use crate::adapters::auth::AuthSessionStore;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the core's storage-facing ports.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn not_found(what: &str, id: impl std::fmt::Display) -> impl FnOnce(sqlx::Error) -> PortError {
    let message = format!("{} {} not found", what, id);
    move |e| match e {
        sqlx::Error::RowNotFound => PortError::NotFound(message),
        _ => PortError::Unexpected(e.to_string()),
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

/// Unique violations become `Conflict` so callers can treat them as "already done".
fn write_error(e: sqlx::Error) -> PortError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            PortError::Conflict(db.message().to_string())
        }
        _ => PortError::Unexpected(e.to_string()),
    }
}

fn counter(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct UserRecord {
    user_id: Uuid,
    tier: String,
    language: String,
    utc_offset_minutes: i32,
    last_seen_at: Option<DateTime<Utc>>,
}
impl UserRecord {
    fn to_domain(self) -> User {
        User {
            user_id: self.user_id,
            tier: parse_tier(&self.tier),
            language: self.language,
            utc_offset_minutes: self.utc_offset_minutes,
            last_seen_at: self.last_seen_at,
        }
    }
}

fn parse_tier(raw: &str) -> Tier {
    match raw {
        "premium" => Tier::Premium,
        _ => Tier::Free,
    }
}

#[derive(FromRow)]
struct UsageCountersRecord {
    daily_generations: i32,
    daily_window: Option<NaiveDate>,
    lifetime_generations: i32,
    monthly_audio_seconds: i32,
    audio_window: Option<NaiveDate>,
}
impl UsageCountersRecord {
    fn to_domain(self) -> UsageCounters {
        UsageCounters {
            daily_generations: counter(self.daily_generations),
            daily_window: self.daily_window,
            lifetime_generations: counter(self.lifetime_generations),
            monthly_audio_seconds: counter(self.monthly_audio_seconds),
            audio_window: self.audio_window,
        }
    }
}

#[derive(FromRow)]
struct StoryRecord {
    id: Uuid,
    is_daily_free: bool,
    content_length: i32,
}
impl StoryRecord {
    fn to_domain(self) -> Story {
        Story {
            id: self.id,
            is_daily_free: self.is_daily_free,
            content_length: usize::try_from(self.content_length).unwrap_or(0),
        }
    }
}

#[derive(FromRow)]
struct PersonalizedStoryRecord {
    id: Uuid,
    owner_id: Uuid,
}
impl PersonalizedStoryRecord {
    fn to_domain(self) -> PersonalizedStory {
        PersonalizedStory {
            id: self.id,
            owner_id: self.owner_id,
        }
    }
}

#[derive(FromRow)]
struct ReadingSessionRecord {
    id: Uuid,
    user_id: Uuid,
    story_id: Uuid,
    is_personalized: bool,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    duration_seconds: i64,
    completed: bool,
}
impl ReadingSessionRecord {
    fn to_domain(self) -> ReadingSession {
        ReadingSession {
            id: self.id,
            user_id: self.user_id,
            story_id: self.story_id,
            is_personalized: self.is_personalized,
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration_seconds: self.duration_seconds,
            completed: self.completed,
        }
    }
}

#[derive(FromRow)]
struct AchievementRecord {
    user_id: Uuid,
    achievement_id: String,
    unlocked_at: DateTime<Utc>,
}
impl AchievementRecord {
    fn to_domain(self) -> AchievementGrant {
        AchievementGrant {
            user_id: self.user_id,
            achievement_id: self.achievement_id,
            unlocked_at: self.unlocked_at,
        }
    }
}

#[derive(FromRow)]
struct AuthSessionRecord {
    id: String,
    user_id: Uuid,
    expires_at: DateTime<Utc>,
}
impl AuthSessionRecord {
    fn to_domain(self) -> AuthSession {
        AuthSession {
            id: self.id,
            user_id: self.user_id,
            expires_at: self.expires_at,
        }
    }
}

const SESSION_COLUMNS: &str =
    "id, user_id, story_id, is_personalized, started_at, ended_at, duration_seconds, completed";

//=========================================================================================
// `DatabaseService` Trait Implementation
//=========================================================================================

#[async_trait]
impl DatabaseService for DbAdapter {
    async fn get_user(&self, user_id: Uuid) -> PortResult<User> {
        let record = sqlx::query_as::<_, UserRecord>(
            "SELECT user_id, tier, language, utc_offset_minutes, last_seen_at FROM users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(not_found("User", user_id))?;
        Ok(record.to_domain())
    }

    async fn touch_last_seen(&self, user_id: Uuid, at: DateTime<Utc>) -> PortResult<()> {
        let result = sqlx::query("UPDATE users SET last_seen_at = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("User {} not found", user_id)));
        }
        Ok(())
    }

    async fn get_usage_counters(&self, user_id: Uuid) -> PortResult<UsageCounters> {
        let record = sqlx::query_as::<_, UsageCountersRecord>(
            "SELECT daily_generations, daily_window, lifetime_generations, monthly_audio_seconds, audio_window \
             FROM usage_counters WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(record.map(UsageCountersRecord::to_domain).unwrap_or_default())
    }

    async fn get_story(&self, story_id: Uuid) -> PortResult<Story> {
        let record = sqlx::query_as::<_, StoryRecord>(
            "SELECT id, is_daily_free, char_length(content) AS content_length FROM stories WHERE id = $1",
        )
        .bind(story_id)
        .fetch_one(&self.pool)
        .await
        .map_err(not_found("Story", story_id))?;
        Ok(record.to_domain())
    }

    async fn get_personalized_story(&self, story_id: Uuid) -> PortResult<PersonalizedStory> {
        let record = sqlx::query_as::<_, PersonalizedStoryRecord>(
            "SELECT id, owner_id FROM personalized_stories WHERE id = $1",
        )
        .bind(story_id)
        .fetch_one(&self.pool)
        .await
        .map_err(not_found("Personalized story", story_id))?;
        Ok(record.to_domain())
    }

    async fn get_story_progress(&self, user_id: Uuid, story_id: Uuid) -> PortResult<Option<f64>> {
        let progress: Option<(f64,)> = sqlx::query_as(
            "SELECT progress FROM story_progress WHERE user_id = $1 AND story_id = $2",
        )
        .bind(user_id)
        .bind(story_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(progress.map(|(p,)| p))
    }

    async fn save_story_progress(
        &self,
        user_id: Uuid,
        story_id: Uuid,
        progress: f64,
    ) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO story_progress (user_id, story_id, progress) VALUES ($1, $2, $3) \
             ON CONFLICT (user_id, story_id) DO UPDATE SET progress = EXCLUDED.progress, updated_at = now()",
        )
        .bind(user_id)
        .bind(story_id)
        .bind(progress)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }

    async fn create_reading_session(&self, session: ReadingSession) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO reading_sessions (id, user_id, story_id, is_personalized, started_at, duration_seconds, completed) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(session.story_id)
        .bind(session.is_personalized)
        .bind(session.started_at)
        .bind(session.duration_seconds)
        .bind(session.completed)
        .execute(&self.pool)
        .await
        .map_err(write_error)?;
        Ok(())
    }

    async fn close_reading_session(
        &self,
        session_id: Uuid,
        closure: SessionClosure,
    ) -> PortResult<bool> {
        let result = sqlx::query(
            "UPDATE reading_sessions SET ended_at = $2, duration_seconds = $3, completed = $4 WHERE id = $1 AND ended_at IS NULL",
        )
        .bind(session_id)
        .bind(closure.ended_at)
        .bind(closure.duration_seconds)
        .bind(closure.completed)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_open_sessions(&self, user_id: Uuid) -> PortResult<Vec<ReadingSession>> {
        let records = sqlx::query_as::<_, ReadingSessionRecord>(&format!(
            "SELECT {} FROM reading_sessions WHERE user_id = $1 AND ended_at IS NULL ORDER BY started_at ASC",
            SESSION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn get_sessions_by_user(&self, user_id: Uuid) -> PortResult<Vec<ReadingSession>> {
        let records = sqlx::query_as::<_, ReadingSessionRecord>(&format!(
            "SELECT {} FROM reading_sessions WHERE user_id = $1 ORDER BY started_at ASC",
            SESSION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn get_achievement_grant(
        &self,
        user_id: Uuid,
        achievement_id: &str,
    ) -> PortResult<Option<AchievementGrant>> {
        let record = sqlx::query_as::<_, AchievementRecord>(
            "SELECT user_id, achievement_id, unlocked_at FROM user_achievements \
             WHERE user_id = $1 AND achievement_id = $2",
        )
        .bind(user_id)
        .bind(achievement_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(record.map(AchievementRecord::to_domain))
    }

    async fn insert_achievement_grant(&self, grant: AchievementGrant) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO user_achievements (user_id, achievement_id, unlocked_at) VALUES ($1, $2, $3)",
        )
        .bind(grant.user_id)
        .bind(&grant.achievement_id)
        .bind(grant.unlocked_at)
        .execute(&self.pool)
        .await
        .map_err(write_error)?;
        Ok(())
    }

    async fn get_achievement_grants(&self, user_id: Uuid) -> PortResult<Vec<AchievementGrant>> {
        let records = sqlx::query_as::<_, AchievementRecord>(
            "SELECT user_id, achievement_id, unlocked_at FROM user_achievements \
             WHERE user_id = $1 ORDER BY unlocked_at ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }
}

//=========================================================================================
// Entitlement and Schedule Ports
//=========================================================================================

#[async_trait]
impl EntitlementOracle for DbAdapter {
    async fn resolve_tier(&self, user_id: Uuid) -> PortResult<Tier> {
        let (tier,): (String,) = sqlx::query_as("SELECT tier FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(not_found("User", user_id))?;
        Ok(parse_tier(&tier))
    }
}

#[async_trait]
impl DailyStoryService for DbAdapter {
    async fn daily_free_story_id(&self, date: NaiveDate) -> PortResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT story_id FROM daily_stories WHERE date = $1")
                .bind(date)
                .fetch_optional(&self.pool)
                .await
                .map_err(unexpected)?;
        Ok(row.map(|(id,)| id))
    }
}

//=========================================================================================
// Auth Sessions
//=========================================================================================

#[async_trait]
impl AuthSessionStore for DbAdapter {
    async fn find_auth_session(&self, token: &str) -> PortResult<Option<AuthSession>> {
        let record = sqlx::query_as::<_, AuthSessionRecord>(
            "SELECT id, user_id, expires_at FROM auth_sessions WHERE id = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(record.map(AuthSessionRecord::to_domain))
    }

    async fn extend_auth_session(
        &self,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> PortResult<AuthSession> {
        let record = sqlx::query_as::<_, AuthSessionRecord>(
            "UPDATE auth_sessions SET expires_at = $2 WHERE id = $1 RETURNING id, user_id, expires_at",
        )
        .bind(token)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::Unauthorized,
            _ => PortError::Unexpected(e.to_string()),
        })?;
        Ok(record.to_domain())
    }
}
