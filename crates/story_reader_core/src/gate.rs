//! crates/story_reader_core/src/gate.rs
//!
//! The progress gate decides how far a caller may read a story right now.
//!
//! Priority order:
//! 1. personalized stories are always fully readable,
//! 2. the scheduled daily-free story is fully readable for everyone, guests included,
//! 3. guests stop at the fixed guest ceiling,
//! 4. everyone else gets whatever their tier allows.
//!
//! A failing daily-story lookup only loses the bypass; a failing entitlement
//! lookup degrades to the guest ceiling. Neither ever blocks reading outright.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::domain::{Caller, ReadingLimitDecision, StoryRef, GUEST_MAX_PROGRESS};
use crate::entitlement::EntitlementResolver;
use crate::ports::DailyStoryService;

#[async_trait]
pub trait ReadingGate: Send + Sync {
    async fn check_reading_limit(&self, caller: Caller, story: StoryRef) -> ReadingLimitDecision;
}

pub struct ProgressGate {
    schedule: Arc<dyn DailyStoryService>,
    resolver: Arc<EntitlementResolver>,
    clock: Arc<dyn Clock>,
}

impl ProgressGate {
    pub fn new(
        schedule: Arc<dyn DailyStoryService>,
        resolver: Arc<EntitlementResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            schedule,
            resolver,
            clock,
        }
    }

    /// `None` when the schedule could not be read.
    async fn is_daily_free(&self, story: StoryRef) -> Option<bool> {
        let today = self.clock.now().date_naive();
        match self.schedule.daily_free_story_id(today).await {
            Ok(daily_id) => Some(daily_id == Some(story.id())),
            Err(e) => {
                warn!(
                    "Daily story lookup failed, continuing without bypass: {}",
                    e
                );
                None
            }
        }
    }

    async fn tier_decision(&self, caller: Caller, story: StoryRef) -> ReadingLimitDecision {
        let user_id = match caller {
            Caller::Guest => return ReadingLimitDecision::guest(),
            Caller::User(user_id) => user_id,
        };

        match self.resolver.get_usage_limits(user_id).await {
            Ok(limits) if limits.has_unlimited_reading() => {
                ReadingLimitDecision::full("Included in your plan.")
            }
            Ok(limits) => {
                debug!(
                    "User {} capped at {} on story {}",
                    user_id,
                    limits.max_story_progress,
                    story.id()
                );
                ReadingLimitDecision::capped(
                    limits.max_story_progress,
                    "Upgrade to Premium to finish this story.",
                )
            }
            Err(e) => {
                warn!(
                    "Falling back to guest ceiling for user {}: {}",
                    user_id, e
                );
                ReadingLimitDecision::capped(
                    GUEST_MAX_PROGRESS,
                    "We couldn't verify your subscription. Try again shortly.",
                )
                .into_degraded()
            }
        }
    }
}

#[async_trait]
impl ReadingGate for ProgressGate {
    async fn check_reading_limit(&self, caller: Caller, story: StoryRef) -> ReadingLimitDecision {
        if story.is_personalized() {
            return ReadingLimitDecision::full("Personalized stories are always free to read.");
        }

        let daily = self.is_daily_free(story).await;
        if daily == Some(true) {
            return ReadingLimitDecision::full("Today's free story.");
        }

        let decision = self.tier_decision(caller, story).await;
        if daily.is_none() {
            decision.into_degraded()
        } else {
            decision
        }
    }
}
