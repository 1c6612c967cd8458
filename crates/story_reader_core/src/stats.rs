//! crates/story_reader_core/src/stats.rs
//!
//! Streaks and reading statistics, always derived from session history.
//! Nothing here is stored, so the numbers cannot drift from the sessions.

use chrono::{FixedOffset, NaiveDate};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::{ReadingSession, ReadingStats, StreakData};
use crate::error::EngineResult;
use crate::ports::DatabaseService;

/// Local calendar days with at least one completed, closed session.
pub fn active_days(sessions: &[ReadingSession], offset: FixedOffset) -> BTreeSet<NaiveDate> {
    sessions
        .iter()
        .filter(|s| s.completed && !s.is_open())
        .map(|s| s.started_at.with_timezone(&offset).date_naive())
        .collect()
}

/// The current streak counts back from today. A day without reading yet does not
/// break the streak until it is over, so counting starts from yesterday in that case.
pub fn streak_data(sessions: &[ReadingSession], today: NaiveDate, offset: FixedOffset) -> StreakData {
    let days = active_days(sessions, offset);

    let mut current = 0;
    let yesterday = today.pred_opt();
    let start = if days.contains(&today) {
        Some(today)
    } else {
        yesterday.filter(|day| days.contains(day))
    };
    let mut cursor = start;
    while let Some(day) = cursor.filter(|day| days.contains(day)) {
        current += 1;
        cursor = day.pred_opt();
    }

    let mut longest = 0;
    let mut run = 0;
    let mut previous: Option<NaiveDate> = None;
    for day in &days {
        run = match previous {
            Some(prev) if prev.succ_opt() == Some(*day) => run + 1,
            _ => 1,
        };
        longest = longest.max(run);
        previous = Some(*day);
    }

    StreakData {
        current_streak: current,
        longest_streak: longest,
        last_active_date: days.iter().next_back().copied(),
    }
}

/// Open sessions are left out of every total until they close.
pub fn reading_stats(
    sessions: &[ReadingSession],
    today: NaiveDate,
    offset: FixedOffset,
) -> ReadingStats {
    let closed: Vec<&ReadingSession> = sessions.iter().filter(|s| !s.is_open()).collect();
    let total_reading_seconds: i64 = closed.iter().map(|s| s.duration_seconds.max(0)).sum();
    let completed: Vec<&&ReadingSession> = closed.iter().filter(|s| s.completed).collect();
    let stories_completed = completed
        .iter()
        .map(|s| s.story_id)
        .collect::<HashSet<Uuid>>()
        .len();
    let streak = streak_data(sessions, today, offset);

    ReadingStats {
        total_sessions: closed.len() as u32,
        completed_sessions: completed.len() as u32,
        total_reading_seconds,
        average_session_seconds: if closed.is_empty() {
            0
        } else {
            total_reading_seconds / closed.len() as i64
        },
        stories_completed: stories_completed as u32,
        current_streak: streak.current_streak,
        longest_streak: streak.longest_streak,
        last_active_date: streak.last_active_date,
    }
}

pub struct StatsAggregator {
    db: Arc<dyn DatabaseService>,
    clock: Arc<dyn Clock>,
}

impl StatsAggregator {
    pub fn new(db: Arc<dyn DatabaseService>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub async fn streak(&self, user_id: Uuid) -> EngineResult<StreakData> {
        let user = self.db.get_user(user_id).await?;
        let sessions = self.db.get_sessions_by_user(user_id).await?;
        let today = self.clock.now().with_timezone(&user.offset()).date_naive();
        Ok(streak_data(&sessions, today, user.offset()))
    }

    pub async fn stats(&self, user_id: Uuid) -> EngineResult<ReadingStats> {
        let user = self.db.get_user(user_id).await?;
        let sessions = self.db.get_sessions_by_user(user_id).await?;
        let today = self.clock.now().with_timezone(&user.offset()).date_naive();
        Ok(reading_stats(&sessions, today, user.offset()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::{local_offset, Tier};
    use crate::memory::MemoryStore;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 5, d).unwrap()
    }

    fn session_on(
        user_id: Uuid,
        started_at: DateTime<Utc>,
        seconds: i64,
        completed: bool,
    ) -> ReadingSession {
        ReadingSession {
            id: Uuid::new_v4(),
            user_id,
            story_id: Uuid::new_v4(),
            is_personalized: false,
            started_at,
            ended_at: Some(started_at + Duration::seconds(seconds)),
            duration_seconds: seconds,
            completed,
        }
    }

    fn noon(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn streak_counts_consecutive_days_and_breaks_on_gaps() {
        let user = Uuid::new_v4();
        let sessions = vec![
            session_on(user, noon(1), 300, true),
            session_on(user, noon(2), 300, true),
            // May 3rd missing.
            session_on(user, noon(4), 300, true),
            session_on(user, noon(5), 60, true),
            session_on(user, noon(6), 120, true),
        ];

        let streak = streak_data(&sessions, day(6), local_offset(0));

        assert_eq!(streak.current_streak, 3);
        assert_eq!(streak.longest_streak, 3);
        assert_eq!(streak.last_active_date, Some(day(6)));
    }

    #[test]
    fn streak_survives_until_today_is_over() {
        let user = Uuid::new_v4();
        let sessions = vec![
            session_on(user, noon(4), 300, true),
            session_on(user, noon(5), 300, true),
        ];
        assert_eq!(
            streak_data(&sessions, day(6), local_offset(0)).current_streak,
            2
        );
        assert_eq!(
            streak_data(&sessions, day(7), local_offset(0)).current_streak,
            0
        );
    }

    #[test]
    fn incomplete_and_open_sessions_do_not_count() {
        let user = Uuid::new_v4();
        let mut open = session_on(user, noon(6), 0, true);
        open.ended_at = None;
        let sessions = vec![session_on(user, noon(5), 5, false), open];

        let stats = reading_stats(&sessions, day(6), local_offset(0));

        assert_eq!(stats.current_streak, 0);
        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.total_reading_seconds, 5);
    }

    #[test]
    fn recomputing_from_the_same_history_is_stable() {
        let user = Uuid::new_v4();
        let sessions: Vec<_> = (1..=6)
            .map(|d| session_on(user, noon(d), 100, d != 3))
            .collect();

        let first = streak_data(&sessions, day(6), local_offset(0));
        let second = streak_data(&sessions, day(6), local_offset(0));
        assert_eq!(first, second);
    }

    #[test]
    fn local_offset_moves_sessions_across_midnight() {
        let user = Uuid::new_v4();
        // 23:30 UTC on the 5th is the 6th in UTC+2.
        let late = Utc.with_ymd_and_hms(2026, 5, 5, 23, 30, 0).unwrap();
        let sessions = vec![session_on(user, late, 100, true)];

        let days = active_days(&sessions, local_offset(120));
        assert!(days.contains(&day(6)));
    }

    #[test]
    fn totals_and_distinct_stories() {
        let user = Uuid::new_v4();
        let mut repeat = session_on(user, noon(2), 200, true);
        let first = session_on(user, noon(1), 100, true);
        repeat.story_id = first.story_id;
        let sessions = vec![first, repeat, session_on(user, noon(3), 300, false)];

        let stats = reading_stats(&sessions, day(3), local_offset(0));

        assert_eq!(stats.total_sessions, 3);
        assert_eq!(stats.completed_sessions, 2);
        assert_eq!(stats.total_reading_seconds, 600);
        assert_eq!(stats.average_session_seconds, 200);
        assert_eq!(stats.stories_completed, 1);
    }

    #[tokio::test]
    async fn aggregator_reads_history_from_the_store() {
        let store = Arc::new(MemoryStore::new());
        let user_id = store.add_user_with_tier(Tier::Free);
        store.insert_session(session_on(user_id, noon(5), 120, true));
        store.insert_session(session_on(user_id, noon(6), 60, true));
        let clock = Arc::new(ManualClock::new(noon(6) + Duration::hours(3)));
        let aggregator = StatsAggregator::new(store, clock);

        let stats = aggregator.stats(user_id).await.unwrap();
        assert_eq!(stats.current_streak, 2);
        assert_eq!(stats.total_reading_seconds, 180);
        assert_eq!(aggregator.streak(user_id).await.unwrap().current_streak, 2);
    }
}
