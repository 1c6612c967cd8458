//! crates/story_reader_core/src/achievements.rs
//!
//! At-most-once achievement grants, plus the catalog of predicates callers
//! evaluate at session close.

use chrono::{FixedOffset, Timelike};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::{AchievementGrant, ReadingSession, ReadingStats};
use crate::error::{EngineError, EngineResult};
use crate::ports::{DatabaseService, PortError};

pub const FIRST_STORY: &str = "first_story";
pub const THREE_DAY_STREAK: &str = "three_day_streak";
pub const SEVEN_DAY_STREAK: &str = "seven_day_streak";
pub const TEN_STORIES: &str = "ten_stories";
pub const NIGHT_OWL: &str = "night_owl";
pub const HOUR_OF_READING: &str = "hour_of_reading";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AchievementDefinition {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

pub const CATALOG: &[AchievementDefinition] = &[
    AchievementDefinition {
        id: FIRST_STORY,
        name: "First Story",
        description: "Finish your first story.",
    },
    AchievementDefinition {
        id: THREE_DAY_STREAK,
        name: "On a Roll",
        description: "Read three days in a row.",
    },
    AchievementDefinition {
        id: SEVEN_DAY_STREAK,
        name: "Week of Stories",
        description: "Read seven days in a row.",
    },
    AchievementDefinition {
        id: TEN_STORIES,
        name: "Bookworm",
        description: "Finish ten different stories.",
    },
    AchievementDefinition {
        id: NIGHT_OWL,
        name: "Night Owl",
        description: "Read a story after 8pm.",
    },
    AchievementDefinition {
        id: HOUR_OF_READING,
        name: "Hour of Reading",
        description: "Spend a full hour reading.",
    },
];

const NIGHT_OWL_HOUR: u32 = 20;

pub fn definition(id: &str) -> Option<&'static AchievementDefinition> {
    CATALOG.iter().find(|d| d.id == id)
}

pub struct AchievementRules;

impl AchievementRules {
    /// Every achievement whose predicate currently holds. Granting is left to the engine.
    pub fn earned(
        stats: &ReadingStats,
        last_session: Option<&ReadingSession>,
        offset: FixedOffset,
    ) -> Vec<&'static str> {
        let mut earned = Vec::new();
        if stats.stories_completed >= 1 {
            earned.push(FIRST_STORY);
        }
        if stats.current_streak >= 3 {
            earned.push(THREE_DAY_STREAK);
        }
        if stats.current_streak >= 7 {
            earned.push(SEVEN_DAY_STREAK);
        }
        if stats.stories_completed >= 10 {
            earned.push(TEN_STORIES);
        }
        if let Some(session) = last_session {
            if session.completed
                && session.started_at.with_timezone(&offset).hour() >= NIGHT_OWL_HOUR
            {
                earned.push(NIGHT_OWL);
            }
        }
        if stats.total_reading_seconds >= 3600 {
            earned.push(HOUR_OF_READING);
        }
        earned
    }
}

pub struct AchievementEngine {
    db: Arc<dyn DatabaseService>,
    clock: Arc<dyn Clock>,
}

impl AchievementEngine {
    pub fn new(db: Arc<dyn DatabaseService>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Grants `achievement_id` unless it already was. Returns whether a new grant happened.
    pub async fn check_and_grant(&self, user_id: Uuid, achievement_id: &str) -> EngineResult<bool> {
        if self
            .db
            .get_achievement_grant(user_id, achievement_id)
            .await?
            .is_some()
        {
            return Ok(false);
        }

        let grant = AchievementGrant {
            user_id,
            achievement_id: achievement_id.to_string(),
            unlocked_at: self.clock.now(),
        };
        match self.db.insert_achievement_grant(grant).await {
            Ok(()) => {
                info!("User {} unlocked {}", user_id, achievement_id);
                Ok(true)
            }
            Err(PortError::Conflict(_)) => {
                let conflict = EngineError::AchievementGrantConflict(achievement_id.to_string());
                debug!("{}", conflict);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Grants each id in turn and returns the newly unlocked ones. Failures are logged.
    pub async fn grant_all(&self, user_id: Uuid, achievement_ids: &[&str]) -> Vec<String> {
        let mut unlocked = Vec::new();
        for id in achievement_ids {
            match self.check_and_grant(user_id, id).await {
                Ok(true) => unlocked.push(id.to_string()),
                Ok(false) => {}
                Err(e) => error!("Failed to grant {} to {}: {}", id, user_id, e),
            }
        }
        unlocked
    }

    pub async fn list(&self, user_id: Uuid) -> EngineResult<Vec<AchievementGrant>> {
        Ok(self.db.get_achievement_grants(user_id).await?)
    }
}
