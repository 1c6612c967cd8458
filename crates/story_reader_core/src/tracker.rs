//! crates/story_reader_core/src/tracker.rs
//!
//! Turns scroll geometry into a progress fraction for one open story view,
//! enforces the gate's ceiling and persists what the reader is allowed to keep.
//!
//! Gate checks are asynchronous and scroll events arrive faster than they resolve,
//! so each event carries a sequence number and a result that resolves after a newer
//! event has been applied is dropped. Progress never rolls backward because of a
//! slow check.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::{clamp_fraction, Caller, ReadingLimitDecision, StoryRef, PROGRESS_EPSILON};
use crate::gate::ReadingGate;
use crate::ports::{DatabaseService, ViewSink};
use crate::scope::ViewScope;

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    /// Delay before snapping the view back to the ceiling.
    pub correction_delay: Duration,
    /// Settling delay before replaying saved progress.
    pub restore_delay: Duration,
    /// Saved progress at or below this fraction is not replayed.
    pub restore_threshold: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            correction_delay: Duration::from_millis(150),
            restore_delay: Duration::from_millis(300),
            restore_threshold: 0.05,
        }
    }
}

/// One scroll measurement from the UI.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollGeometry {
    pub offset: f64,
    pub viewport_height: f64,
    pub content_height: f64,
}

impl ScrollGeometry {
    pub fn scrollable_height(&self) -> f64 {
        (self.content_height - self.viewport_height).max(0.0)
    }

    /// Content that fits in the viewport counts as fully read.
    pub fn progress(&self) -> f64 {
        if self.content_height <= self.viewport_height {
            return 1.0;
        }
        clamp_fraction(self.offset / self.scrollable_height())
    }

    pub fn offset_for(&self, fraction: f64) -> f64 {
        clamp_fraction(fraction) * self.scrollable_height()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScrollOutcome {
    Accepted { progress: f64 },
    /// Progress hit the ceiling. `paywall_fired` is false while an earlier paywall is still latched.
    Clamped { progress: f64, paywall_fired: bool },
    /// A newer event was applied first, or the view has closed.
    Stale,
}

impl ScrollOutcome {
    pub fn progress(&self) -> Option<f64> {
        match self {
            ScrollOutcome::Accepted { progress } | ScrollOutcome::Clamped { progress, .. } => {
                Some(*progress)
            }
            ScrollOutcome::Stale => None,
        }
    }
}

#[derive(Default)]
struct TrackerState {
    content_height: f64,
    viewport_height: f64,
    progress: f64,
    applied_seq: u64,
    persisted: Option<f64>,
    paywall_latched: bool,
    saved_progress: Option<f64>,
    saved_loaded: bool,
    restore_done: bool,
}

pub struct ScrollTracker {
    caller: Caller,
    story: StoryRef,
    gate: Arc<dyn ReadingGate>,
    db: Arc<dyn DatabaseService>,
    sink: Arc<dyn ViewSink>,
    scope: ViewScope,
    config: TrackerConfig,
    next_seq: AtomicU64,
    correction_gen: Arc<AtomicU64>,
    writes: AtomicU64,
    state: Mutex<TrackerState>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl ScrollTracker {
    pub fn new(
        caller: Caller,
        story: StoryRef,
        gate: Arc<dyn ReadingGate>,
        db: Arc<dyn DatabaseService>,
        sink: Arc<dyn ViewSink>,
        scope: ViewScope,
        config: TrackerConfig,
    ) -> Self {
        Self {
            caller,
            story,
            gate,
            db,
            sink,
            scope,
            config,
            next_seq: AtomicU64::new(0),
            correction_gen: Arc::new(AtomicU64::new(0)),
            writes: AtomicU64::new(0),
            state: Mutex::new(TrackerState::default()),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn story(&self) -> StoryRef {
        self.story
    }

    pub fn progress(&self) -> f64 {
        self.state().progress
    }

    pub fn scope(&self) -> &ViewScope {
        &self.scope
    }

    /// Number of progress values written to the store so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Loads the saved progress once per open and replays it when layout is known.
    pub async fn load_saved_progress(&self) {
        let saved = match self.caller.user_id() {
            Some(user_id) => match self.db.get_story_progress(user_id, self.story.id()).await {
                Ok(saved) => saved.map(clamp_fraction),
                Err(e) => {
                    warn!(
                        "Could not load saved progress for story {}: {}",
                        self.story.id(),
                        e
                    );
                    None
                }
            },
            None => None,
        };

        {
            let mut state = self.state();
            state.saved_progress = saved;
            state.saved_loaded = true;
            if let Some(saved) = saved {
                state.persisted = Some(saved);
                if state.applied_seq == 0 {
                    state.progress = saved;
                }
            }
        }
        self.try_restore();
    }

    pub fn saved_progress(&self) -> Option<f64> {
        self.state().saved_progress
    }

    /// Records content and viewport measurements without a scroll event.
    pub fn on_layout(&self, content_height: f64, viewport_height: f64) {
        {
            let mut state = self.state();
            state.content_height = content_height;
            state.viewport_height = viewport_height;
        }
        self.try_restore();
    }

    fn try_restore(&self) {
        let mut state = self.state();
        if state.restore_done || !state.saved_loaded {
            return;
        }
        let saved = match state.saved_progress {
            Some(saved) if saved > self.config.restore_threshold => saved,
            _ => {
                state.restore_done = true;
                return;
            }
        };
        if state.content_height <= 0.0 || state.viewport_height <= 0.0 {
            return;
        }
        state.restore_done = true;

        let geometry = ScrollGeometry {
            offset: 0.0,
            viewport_height: state.viewport_height,
            content_height: state.content_height,
        };
        drop(state);

        if geometry.scrollable_height() <= 0.0 {
            return;
        }
        let target = geometry.offset_for(saved);
        let sink = self.sink.clone();
        debug!(
            "Replaying saved progress {} for story {}",
            saved,
            self.story.id()
        );
        self.scope
            .schedule(self.config.restore_delay, move || sink.scroll_to(target));
    }

    pub async fn on_scroll(&self, geometry: ScrollGeometry) -> ScrollOutcome {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut state = self.state();
            state.content_height = geometry.content_height;
            state.viewport_height = geometry.viewport_height;
        }
        let raw = geometry.progress();

        let decision = if self.story.is_personalized() {
            None
        } else {
            Some(
                self.gate
                    .check_reading_limit(self.caller, self.story)
                    .await,
            )
        };

        if !self.scope.is_live() {
            return ScrollOutcome::Stale;
        }

        let paywall = {
            let mut state = self.state();
            if seq <= state.applied_seq {
                debug!(
                    "Discarding stale gate result #{} for story {}",
                    seq,
                    self.story.id()
                );
                return ScrollOutcome::Stale;
            }
            state.applied_seq = seq;

            match &decision {
                Some(decision) if decision.exceeded_by(raw) => {
                    state.progress = decision.max_progress_allowed;
                    let fire = !state.paywall_latched;
                    state.paywall_latched = true;
                    Some(fire)
                }
                _ => {
                    state.progress = raw;
                    state.paywall_latched = false;
                    None
                }
            }
        };

        match (paywall, decision) {
            (Some(paywall_fired), Some(decision)) => {
                let ceiling = decision.max_progress_allowed;
                self.schedule_correction(geometry.offset_for(ceiling));
                if paywall_fired {
                    self.sink.paywall(&decision.reason);
                }
                self.sink.progress(ceiling);
                self.persist(seq, ceiling, &decision, true).await;
                ScrollOutcome::Clamped {
                    progress: ceiling,
                    paywall_fired,
                }
            }
            (_, decision) => {
                self.sink.progress(raw);
                let decision =
                    decision.unwrap_or_else(|| ReadingLimitDecision::full("personalized"));
                self.persist(seq, raw, &decision, false).await;
                ScrollOutcome::Accepted { progress: raw }
            }
        }
    }

    /// Only the newest correction survives; earlier ones see a changed generation and do nothing.
    fn schedule_correction(&self, target: f64) {
        let generation = self.correction_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let current = self.correction_gen.clone();
        let sink = self.sink.clone();
        self.scope.schedule(self.config.correction_delay, move || {
            if current.load(Ordering::SeqCst) == generation {
                sink.scroll_to(target);
            }
        });
    }

    /// A clamped value never replaces a higher one that an earlier decision let the reader keep.
    async fn persist(&self, seq: u64, progress: f64, decision: &ReadingLimitDecision, clamped: bool) {
        let user_id = match self.caller.user_id() {
            Some(user_id) => user_id,
            None => return,
        };
        let progress = if decision.can_read_full {
            progress
        } else {
            progress.min(decision.max_progress_allowed)
        };

        let _guard = self.persist_lock.lock().await;
        {
            let state = self.state();
            if state.applied_seq != seq {
                return;
            }
            if let Some(persisted) = state.persisted {
                if (persisted - progress).abs() <= PROGRESS_EPSILON {
                    return;
                }
                if clamped && persisted > progress {
                    debug!(
                        "Keeping saved progress {} for story {} over ceiling {}",
                        persisted,
                        self.story.id(),
                        progress
                    );
                    return;
                }
            }
        }

        match self
            .db
            .save_story_progress(user_id, self.story.id(), progress)
            .await
        {
            Ok(()) => {
                self.state().persisted = Some(progress);
                self.writes.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => warn!(
                "Failed to persist progress {} for story {}: {}",
                progress,
                self.story.id(),
                e
            ),
        }
    }

    /// Tears the view down. Pending corrections and replays never fire afterwards.
    pub fn close(&self) {
        self.scope.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::domain::{Tier, GUEST_MAX_PROGRESS};
    use crate::entitlement::{EntitlementResolver, TierTable};
    use crate::gate::ProgressGate;
    use crate::memory::MemoryStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq)]
    enum ViewEvent {
        Progress(f64),
        Paywall(String),
        ScrollTo(f64),
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ViewEvent>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<ViewEvent> {
            self.events.lock().unwrap().clone()
        }

        fn paywalls(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    ViewEvent::Paywall(msg) => Some(msg),
                    _ => None,
                })
                .collect()
        }

        fn scrolls(&self) -> Vec<f64> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    ViewEvent::ScrollTo(offset) => Some(offset),
                    _ => None,
                })
                .collect()
        }
    }

    impl ViewSink for RecordingSink {
        fn progress(&self, fraction: f64) {
            self.events.lock().unwrap().push(ViewEvent::Progress(fraction));
        }

        fn paywall(&self, message: &str) {
            self.events
                .lock()
                .unwrap()
                .push(ViewEvent::Paywall(message.to_string()));
        }

        fn scroll_to(&self, offset: f64) {
            self.events.lock().unwrap().push(ViewEvent::ScrollTo(offset));
        }
    }

    /// Answers with a fixed decision after a per-call delay.
    struct DelayedGate {
        decision: ReadingLimitDecision,
        delays: Mutex<VecDeque<Duration>>,
    }

    #[async_trait]
    impl ReadingGate for DelayedGate {
        async fn check_reading_limit(&self, _: Caller, _: StoryRef) -> ReadingLimitDecision {
            let delay = self.delays.lock().unwrap().pop_front().unwrap_or_default();
            tokio::time::sleep(delay).await;
            self.decision.clone()
        }
    }

    fn geometry(fraction: f64) -> ScrollGeometry {
        ScrollGeometry {
            offset: fraction * 1000.0,
            viewport_height: 800.0,
            content_height: 1800.0,
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        gate: Arc<ProgressGate>,
        daily_story: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let now = Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(now));
        let daily_story = Uuid::new_v4();
        store.schedule_daily_story(now.date_naive(), daily_story);
        let resolver = Arc::new(EntitlementResolver::new(
            store.clone(),
            store.clone(),
            TierTable::default(),
            clock.clone(),
        ));
        let gate = Arc::new(ProgressGate::new(store.clone(), resolver, clock));
        Fixture {
            store,
            gate,
            daily_story,
        }
    }

    fn tracker(
        f: &Fixture,
        caller: Caller,
        story: StoryRef,
        sink: &Arc<RecordingSink>,
    ) -> ScrollTracker {
        ScrollTracker::new(
            caller,
            story,
            f.gate.clone(),
            f.store.clone(),
            sink.clone(),
            ViewScope::new(),
            TrackerConfig::default(),
        )
    }

    #[test]
    fn geometry_maps_offsets_to_fractions() {
        assert_eq!(geometry(0.5).progress(), 0.5);
        assert_eq!(geometry(1.7).progress(), 1.0);
        let overscroll = ScrollGeometry {
            offset: -40.0,
            ..geometry(0.0)
        };
        assert_eq!(overscroll.progress(), 0.0);

        let short = ScrollGeometry {
            offset: 0.0,
            viewport_height: 900.0,
            content_height: 600.0,
        };
        assert_eq!(short.progress(), 1.0);
        assert_eq!(short.offset_for(0.5), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn guest_is_clamped_at_the_guest_ceiling() {
        let f = fixture();
        let sink = Arc::new(RecordingSink::default());
        let tracker = tracker(&f, Caller::Guest, StoryRef::Catalog(Uuid::new_v4()), &sink);

        let mut last = ScrollOutcome::Stale;
        for step in 0..=5 {
            last = tracker.on_scroll(geometry(step as f64 * 0.1)).await;
        }

        assert_eq!(
            last,
            ScrollOutcome::Clamped {
                progress: GUEST_MAX_PROGRESS,
                paywall_fired: false
            }
        );
        assert_eq!(tracker.progress(), GUEST_MAX_PROGRESS);

        let paywalls = sink.paywalls();
        assert_eq!(paywalls.len(), 1);
        assert!(!paywalls[0].is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let scrolls = sink.scrolls();
        assert_eq!(scrolls.len(), 1);
        assert!((scrolls[0] - 300.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn free_user_reads_the_daily_story_in_full() {
        let f = fixture();
        let user_id = f.store.add_user_with_tier(Tier::Free);
        let sink = Arc::new(RecordingSink::default());
        let story = StoryRef::Catalog(f.daily_story);
        let tracker = tracker(&f, Caller::User(user_id), story, &sink);

        let outcome = tracker.on_scroll(geometry(0.9)).await;

        assert_eq!(outcome, ScrollOutcome::Accepted { progress: 0.9 });
        assert!(sink.paywalls().is_empty());
        assert_eq!(f.store.progress(user_id, f.daily_story), Some(0.9));
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_progress_never_exceeds_the_ceiling() {
        let f = fixture();
        let user_id = f.store.add_user_with_tier(Tier::Free);
        let story_id = Uuid::new_v4();
        let sink = Arc::new(RecordingSink::default());
        let tracker = tracker(&f, Caller::User(user_id), StoryRef::Catalog(story_id), &sink);

        for fraction in [0.2, 0.45, 0.8, 1.0, 0.7] {
            tracker.on_scroll(geometry(fraction)).await;
            let saved = f.store.progress(user_id, story_id).unwrap();
            assert!(saved <= 0.5 + PROGRESS_EPSILON, "saved {}", saved);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn paywall_rearms_after_scrolling_back() {
        let f = fixture();
        let sink = Arc::new(RecordingSink::default());
        let tracker = tracker(&f, Caller::Guest, StoryRef::Catalog(Uuid::new_v4()), &sink);

        tracker.on_scroll(geometry(0.6)).await;
        tracker.on_scroll(geometry(0.1)).await;
        tracker.on_scroll(geometry(0.6)).await;

        assert_eq!(sink.paywalls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn entitlement_outage_keeps_saved_progress() {
        let f = fixture();
        let user_id = f.store.add_user_with_tier(Tier::Premium);
        let story_id = Uuid::new_v4();
        f.store
            .save_story_progress(user_id, story_id, 0.8)
            .await
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let tracker = tracker(&f, Caller::User(user_id), StoryRef::Catalog(story_id), &sink);
        tracker.load_saved_progress().await;

        f.store.fail_entitlements(true);
        let outcome = tracker.on_scroll(geometry(0.8)).await;

        assert!(matches!(
            outcome,
            ScrollOutcome::Clamped { progress, .. } if progress == GUEST_MAX_PROGRESS
        ));
        assert_eq!(f.store.progress(user_id, story_id), Some(0.8));
        assert_eq!(tracker.writes(), 0);

        f.store.fail_entitlements(false);
        let outcome = tracker.on_scroll(geometry(0.9)).await;
        assert_eq!(outcome, ScrollOutcome::Accepted { progress: 0.9 });
        assert_eq!(f.store.progress(user_id, story_id), Some(0.9));
        assert_eq!(tracker.writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn personalized_stories_skip_the_gate() {
        let f = fixture();
        let user_id = f.store.add_user_with_tier(Tier::Free);
        let story_id = Uuid::new_v4();
        let gate = Arc::new(DelayedGate {
            decision: ReadingLimitDecision::capped(0.1, "never consulted"),
            delays: Mutex::new(VecDeque::new()),
        });
        let sink = Arc::new(RecordingSink::default());
        let tracker = ScrollTracker::new(
            Caller::User(user_id),
            StoryRef::Personalized(story_id),
            gate,
            f.store.clone(),
            sink.clone(),
            ViewScope::new(),
            TrackerConfig::default(),
        );

        let outcome = tracker.on_scroll(geometry(1.0)).await;
        assert_eq!(outcome, ScrollOutcome::Accepted { progress: 1.0 });
        assert_eq!(f.store.progress(user_id, story_id), Some(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_gate_results_do_not_roll_progress_back() {
        let f = fixture();
        let user_id = f.store.add_user_with_tier(Tier::Premium);
        let story_id = Uuid::new_v4();
        let gate = Arc::new(DelayedGate {
            decision: ReadingLimitDecision::full("premium"),
            delays: Mutex::new(VecDeque::from([
                Duration::from_millis(500),
                Duration::from_millis(10),
            ])),
        });
        let sink = Arc::new(RecordingSink::default());
        let tracker = ScrollTracker::new(
            Caller::User(user_id),
            StoryRef::Catalog(story_id),
            gate,
            f.store.clone(),
            sink.clone(),
            ViewScope::new(),
            TrackerConfig::default(),
        );

        let (first, second) = tokio::join!(
            tracker.on_scroll(geometry(0.2)),
            tracker.on_scroll(geometry(0.6)),
        );

        assert_eq!(first, ScrollOutcome::Stale);
        assert_eq!(second, ScrollOutcome::Accepted { progress: 0.6 });
        assert_eq!(tracker.progress(), 0.6);
        assert_eq!(f.store.progress(user_id, story_id), Some(0.6));
    }

    #[tokio::test(start_paused = true)]
    async fn saved_progress_is_replayed_once_after_layout() {
        let f = fixture();
        let user_id = f.store.add_user_with_tier(Tier::Premium);
        let story_id = Uuid::new_v4();
        f.store
            .save_story_progress(user_id, story_id, 0.4)
            .await
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let tracker = tracker(&f, Caller::User(user_id), StoryRef::Catalog(story_id), &sink);

        tracker.load_saved_progress().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(sink.scrolls().is_empty(), "no layout yet");

        tracker.on_layout(1800.0, 800.0);
        tracker.on_layout(1800.0, 800.0);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let scrolls = sink.scrolls();
        assert_eq!(scrolls.len(), 1);
        assert!((scrolls[0] - 400.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn tiny_saved_progress_is_not_replayed() {
        let f = fixture();
        let user_id = f.store.add_user_with_tier(Tier::Premium);
        let story_id = Uuid::new_v4();
        f.store
            .save_story_progress(user_id, story_id, 0.03)
            .await
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let tracker = tracker(&f, Caller::User(user_id), StoryRef::Catalog(story_id), &sink);

        tracker.on_layout(1800.0, 800.0);
        tracker.load_saved_progress().await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(sink.scrolls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn closing_the_view_cancels_pending_corrections() {
        let f = fixture();
        let sink = Arc::new(RecordingSink::default());
        let tracker = tracker(&f, Caller::Guest, StoryRef::Catalog(Uuid::new_v4()), &sink);

        tracker.on_scroll(geometry(0.9)).await;
        tracker.close();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(sink.scrolls().is_empty());
        assert_eq!(tracker.on_scroll(geometry(0.1)).await, ScrollOutcome::Stale);
    }
}
