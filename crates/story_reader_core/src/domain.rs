//! crates/story_reader_core/src/domain.rs
//!
//! Defines the pure, core data structures for the reading engine.
//! These structs are independent of any database or serialization format.

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The fixed ceiling for unauthenticated readers on non-exempt stories.
pub const GUEST_MAX_PROGRESS: f64 = 0.30;

//=========================================================================================
// Users and Callers
//=========================================================================================

/// A subscription tier as resolved by the entitlement oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Premium,
}

/// Represents an account - used throughout the engine.
#[derive(Debug, Clone)]
pub struct User {
    pub user_id: Uuid,
    pub tier: Tier,
    pub language: String,
    /// Offset of the user's locale from UTC, used for local midnight and calendar days.
    pub utc_offset_minutes: i32,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn offset(&self) -> FixedOffset {
        local_offset(self.utc_offset_minutes)
    }
}

/// Converts a minute offset into a `FixedOffset`, falling back to UTC when out of range.
pub fn local_offset(minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix())
}

/// Whoever is reading: a signed-in user or a guest without an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Caller {
    Guest,
    User(Uuid),
}

impl Caller {
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Caller::Guest => None,
            Caller::User(id) => Some(*id),
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Caller::Guest)
    }
}

//=========================================================================================
// Stories
//=========================================================================================

/// Catalog content, read-only to the engine.
#[derive(Debug, Clone)]
pub struct Story {
    pub id: Uuid,
    pub is_daily_free: bool,
    /// Content size, used as a length proxy.
    pub content_length: usize,
}

/// A story generated for (and owned by) one user.
#[derive(Debug, Clone)]
pub struct PersonalizedStory {
    pub id: Uuid,
    pub owner_id: Uuid,
}

/// The story a reading view is showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoryRef {
    Catalog(Uuid),
    Personalized(Uuid),
}

impl StoryRef {
    pub fn id(&self) -> Uuid {
        match self {
            StoryRef::Catalog(id) | StoryRef::Personalized(id) => *id,
        }
    }

    pub fn is_personalized(&self) -> bool {
        matches!(self, StoryRef::Personalized(_))
    }
}

impl From<&Story> for StoryRef {
    fn from(story: &Story) -> Self {
        StoryRef::Catalog(story.id)
    }
}

impl From<&PersonalizedStory> for StoryRef {
    fn from(story: &PersonalizedStory) -> Self {
        StoryRef::Personalized(story.id)
    }
}

//=========================================================================================
// Usage and Limits
//=========================================================================================

/// Raw consumption counters as persisted by the store.
#[derive(Debug, Clone, Default)]
pub struct UsageCounters {
    pub daily_generations: u32,
    /// Local calendar day `daily_generations` was counted for.
    pub daily_window: Option<NaiveDate>,
    pub lifetime_generations: u32,
    pub monthly_audio_seconds: u32,
    /// First day of the month `monthly_audio_seconds` was counted for.
    pub audio_window: Option<NaiveDate>,
}

/// Which generation cap governs a user right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationAllowance {
    Daily {
        used: u32,
        limit: u32,
        resets_at: DateTime<Utc>,
    },
    Lifetime {
        used: u32,
        limit: u32,
    },
    Unlimited,
}

/// A snapshot of a user's consumption against their tier. Recomputed on demand.
#[derive(Debug, Clone, Serialize)]
pub struct UsageLimits {
    pub tier: Tier,
    pub daily_used: u32,
    pub daily_limit: u32,
    pub lifetime_used: u32,
    pub lifetime_limit: Option<u32>,
    pub monthly_audio_used: u32,
    pub monthly_audio_limit: Option<u32>,
    pub max_story_progress: f64,
    pub daily_resets_at: DateTime<Utc>,
    pub monthly_resets_at: DateTime<Utc>,
}

impl UsageLimits {
    /// A daily cap applies only when the tier defines one; otherwise the lifetime
    /// cap governs, and a tier with neither is unbounded.
    pub fn generation_allowance(&self) -> GenerationAllowance {
        if self.daily_limit > 0 {
            GenerationAllowance::Daily {
                used: self.daily_used,
                limit: self.daily_limit,
                resets_at: self.daily_resets_at,
            }
        } else if let Some(limit) = self.lifetime_limit {
            GenerationAllowance::Lifetime {
                used: self.lifetime_used,
                limit,
            }
        } else {
            GenerationAllowance::Unlimited
        }
    }

    pub fn can_generate(&self) -> bool {
        match self.generation_allowance() {
            GenerationAllowance::Daily { used, limit, .. } => used < limit,
            GenerationAllowance::Lifetime { used, limit } => used < limit,
            GenerationAllowance::Unlimited => true,
        }
    }

    /// `None` means the tier has no audio quota.
    pub fn remaining_audio_seconds(&self) -> Option<u32> {
        self.monthly_audio_limit
            .map(|limit| limit.saturating_sub(self.monthly_audio_used))
    }

    pub fn can_use_audio(&self, seconds: u32) -> bool {
        self.remaining_audio_seconds()
            .map_or(true, |remaining| remaining >= seconds)
    }

    pub fn has_unlimited_reading(&self) -> bool {
        self.max_story_progress >= 1.0
    }
}

//=========================================================================================
// Reading Decisions
//=========================================================================================

/// Output of the progress gate for one story. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingLimitDecision {
    pub can_read_full: bool,
    pub max_progress_allowed: f64,
    pub reason: String,
    /// Set when a lookup failed and the decision is a fallback, not the caller's real entitlement.
    #[serde(skip)]
    pub degraded: bool,
}

impl ReadingLimitDecision {
    pub fn full(reason: impl Into<String>) -> Self {
        Self {
            can_read_full: true,
            max_progress_allowed: 1.0,
            reason: reason.into(),
            degraded: false,
        }
    }

    /// A capped decision. A ceiling of 1 or more collapses into a full decision.
    pub fn capped(max_progress_allowed: f64, reason: impl Into<String>) -> Self {
        let max = clamp_fraction(max_progress_allowed);
        if max >= 1.0 {
            return Self::full(reason);
        }
        Self {
            can_read_full: false,
            max_progress_allowed: max,
            reason: reason.into(),
            degraded: false,
        }
    }

    pub fn into_degraded(mut self) -> Self {
        self.degraded = true;
        self
    }

    pub fn guest() -> Self {
        Self::capped(
            GUEST_MAX_PROGRESS,
            "Sign up to keep reading this story.",
        )
    }

    /// True when `progress` is past the ceiling by more than rounding noise.
    pub fn exceeded_by(&self, progress: f64) -> bool {
        !self.can_read_full && progress > self.max_progress_allowed + PROGRESS_EPSILON
    }
}

/// Rounding slack when comparing progress fractions.
pub const PROGRESS_EPSILON: f64 = 1e-9;

/// Clamps into `[0, 1]`, mapping NaN to 0.
pub fn clamp_fraction(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

//=========================================================================================
// Sessions, Streaks and Achievements
//=========================================================================================

/// One continuous reading interval.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub story_id: Uuid,
    pub is_personalized: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: i64,
    pub completed: bool,
}

impl ReadingSession {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Fields stamped onto a session when it closes.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionClosure {
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub completed: bool,
}

/// Daily-engagement summary derived from session history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreakData {
    pub current_streak: u32,
    pub longest_streak: u32,
    pub last_active_date: Option<NaiveDate>,
}

/// Aggregate statistics derived from session history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReadingStats {
    pub total_sessions: u32,
    pub completed_sessions: u32,
    pub total_reading_seconds: i64,
    pub average_session_seconds: i64,
    pub stories_completed: u32,
    pub current_streak: u32,
    pub longest_streak: u32,
    pub last_active_date: Option<NaiveDate>,
}

/// A granted achievement. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AchievementGrant {
    pub user_id: Uuid,
    pub achievement_id: String,
    pub unlocked_at: DateTime<Utc>,
}

//=========================================================================================
// Auth
//=========================================================================================

// Represents a login session issued by the external auth provider.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub id: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}
