//! crates/story_reader_core/src/entitlement.rs
//!
//! Resolves a user's tier and turns persisted counters into a `UsageLimits` snapshot.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::{Tier, UsageCounters, UsageLimits};
use crate::error::{EngineError, EngineResult};
use crate::ports::{DatabaseService, EntitlementOracle};

/// Numeric limits a tier grants.
#[derive(Debug, Clone, PartialEq)]
pub struct TierLimits {
    /// 0 means no daily cap.
    pub daily_generations: u32,
    /// `None` means no lifetime cap.
    pub lifetime_generations: Option<u32>,
    /// `None` means no audio quota.
    pub monthly_audio_seconds: Option<u32>,
    /// Fraction of a regular story the tier may read.
    pub max_story_progress: f64,
}

/// Tier-to-limits mapping, supplied by configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TierTable {
    pub free: TierLimits,
    pub premium: TierLimits,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            free: TierLimits {
                daily_generations: 0,
                lifetime_generations: Some(3),
                monthly_audio_seconds: Some(600),
                max_story_progress: 0.5,
            },
            premium: TierLimits {
                daily_generations: 0,
                lifetime_generations: None,
                monthly_audio_seconds: Some(36_000),
                max_story_progress: 1.0,
            },
        }
    }
}

impl TierTable {
    pub fn limits_for(&self, tier: Tier) -> &TierLimits {
        match tier {
            Tier::Free => &self.free,
            Tier::Premium => &self.premium,
        }
    }
}

pub struct EntitlementResolver {
    db: Arc<dyn DatabaseService>,
    oracle: Arc<dyn EntitlementOracle>,
    tiers: TierTable,
    clock: Arc<dyn Clock>,
}

impl EntitlementResolver {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        oracle: Arc<dyn EntitlementOracle>,
        tiers: TierTable,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            oracle,
            tiers,
            clock,
        }
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    /// Fails with `EntitlementUnavailable` when the oracle or the counter store
    /// cannot be reached.
    pub async fn get_usage_limits(&self, user_id: Uuid) -> EngineResult<UsageLimits> {
        let tier = self.oracle.resolve_tier(user_id).await.map_err(|e| {
            warn!("Tier lookup failed for user {}: {}", user_id, e);
            EngineError::EntitlementUnavailable(e.to_string())
        })?;
        let user = self
            .db
            .get_user(user_id)
            .await
            .map_err(|e| EngineError::EntitlementUnavailable(e.to_string()))?;
        let counters = self
            .db
            .get_usage_counters(user_id)
            .await
            .map_err(|e| {
                warn!("Usage counters unavailable for user {}: {}", user_id, e);
                EngineError::EntitlementUnavailable(e.to_string())
            })?;

        Ok(build_limits(
            tier,
            self.tiers.limits_for(tier),
            &counters,
            self.clock.now(),
            user.offset(),
        ))
    }
}

/// Pure assembly of a snapshot; counters from an earlier day or month read as 0.
pub fn build_limits(
    tier: Tier,
    limits: &TierLimits,
    counters: &UsageCounters,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> UsageLimits {
    let today = now.with_timezone(&offset).date_naive();
    let month_start = first_of_month(today);

    let daily_used = if counters.daily_window == Some(today) {
        counters.daily_generations
    } else {
        0
    };
    let monthly_audio_used = match counters.audio_window {
        Some(window) if first_of_month(window) == month_start => counters.monthly_audio_seconds,
        _ => 0,
    };

    UsageLimits {
        tier,
        daily_used,
        daily_limit: limits.daily_generations,
        lifetime_used: counters.lifetime_generations,
        lifetime_limit: limits.lifetime_generations,
        monthly_audio_used,
        monthly_audio_limit: limits.monthly_audio_seconds,
        max_story_progress: limits.max_story_progress.clamp(0.0, 1.0),
        daily_resets_at: next_local_midnight(now, offset),
        monthly_resets_at: next_month_start(now, offset),
    }
}

pub fn next_local_midnight(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let today = now.with_timezone(&offset).date_naive();
    today
        .succ_opt()
        .and_then(|tomorrow| local_start_of(tomorrow, offset))
        .unwrap_or_else(|| now + Duration::days(1))
}

pub fn next_month_start(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let today = now.with_timezone(&offset).date_naive();
    let (year, month) = if today.month() == 12 {
        (today.year() + 1, 1)
    } else {
        (today.year(), today.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| local_start_of(first, offset))
        .unwrap_or_else(|| now + Duration::days(31))
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn local_start_of(date: NaiveDate, offset: FixedOffset) -> Option<DateTime<Utc>> {
    let midnight = date.and_hms_opt(0, 0, 0)?;
    offset
        .from_local_datetime(&midnight)
        .single()
        .map(|local| local.with_timezone(&Utc))
}
