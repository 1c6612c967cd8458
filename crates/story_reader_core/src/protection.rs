//! crates/story_reader_core/src/protection.rs
//!
//! A single entry point for call sites that already hold a progress number.
//! Decisions come from the gate and are cached for a short time per
//! (caller, story). Fallback decisions made while a lookup was failing are
//! never cached. The paywall callback always runs on a later tick so it
//! never mutates caller state mid-update.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::{clamp_fraction, Caller, ReadingLimitDecision, StoryRef};
use crate::gate::ReadingGate;
use crate::scope::ViewScope;

pub type PaywallCallback = Arc<dyn Fn(String) + Send + Sync>;

const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct ProtectedProgress {
    /// The progress the caller may keep.
    pub progress: f64,
    pub allowed: bool,
    pub decision: ReadingLimitDecision,
}

pub struct ProgressProtection {
    gate: Arc<dyn ReadingGate>,
    scope: ViewScope,
    on_paywall: PaywallCallback,
    ttl: Duration,
    cache: Mutex<HashMap<(Caller, StoryRef), (Instant, ReadingLimitDecision)>>,
}

impl ProgressProtection {
    pub fn new(gate: Arc<dyn ReadingGate>, scope: ViewScope, on_paywall: PaywallCallback) -> Self {
        Self {
            gate,
            scope,
            on_paywall,
            ttl: DEFAULT_TTL,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<(Caller, StoryRef), (Instant, ReadingLimitDecision)>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn decision(&self, caller: Caller, story: StoryRef) -> ReadingLimitDecision {
        if story.is_personalized() {
            return ReadingLimitDecision::full("Personalized stories are always free to read.");
        }

        let cached = self
            .cache()
            .get(&(caller, story))
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, decision)| decision.clone());
        if let Some(decision) = cached {
            return decision;
        }

        let decision = self.gate.check_reading_limit(caller, story).await;
        if decision.degraded {
            self.cache().remove(&(caller, story));
        } else {
            self.cache()
                .insert((caller, story), (Instant::now(), decision.clone()));
        }
        decision
    }

    /// Drops every cached decision, e.g. after a tier change.
    pub fn invalidate(&self) {
        let mut cache = self.cache();
        debug!("Invalidating {} cached reading decisions", cache.len());
        cache.clear();
    }

    pub async fn check_progress(
        &self,
        caller: Caller,
        story: StoryRef,
        progress: f64,
    ) -> ProtectedProgress {
        let progress = clamp_fraction(progress);
        let decision = self.decision(caller, story).await;

        if decision.exceeded_by(progress) {
            let on_paywall = self.on_paywall.clone();
            let reason = decision.reason.clone();
            self.scope.defer(move || on_paywall(reason));
            return ProtectedProgress {
                progress: decision.max_progress_allowed,
                allowed: false,
                decision,
            };
        }

        ProtectedProgress {
            progress,
            allowed: true,
            decision,
        }
    }
}

#[async_trait]
impl ReadingGate for ProgressProtection {
    async fn check_reading_limit(&self, caller: Caller, story: StoryRef) -> ReadingLimitDecision {
        self.decision(caller, story).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct CountingGate {
        calls: AtomicUsize,
        decision: Mutex<ReadingLimitDecision>,
    }

    #[async_trait]
    impl ReadingGate for CountingGate {
        async fn check_reading_limit(&self, _: Caller, _: StoryRef) -> ReadingLimitDecision {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.decision.lock().unwrap().clone()
        }
    }

    fn protection(
        decision: ReadingLimitDecision,
    ) -> (ProgressProtection, Arc<CountingGate>, Arc<Mutex<Vec<String>>>) {
        let gate = Arc::new(CountingGate {
            calls: AtomicUsize::new(0),
            decision: Mutex::new(decision),
        });
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let protection = ProgressProtection::new(
            gate.clone(),
            ViewScope::new(),
            Arc::new(move |reason| sink.lock().unwrap().push(reason)),
        );
        (protection, gate, fired)
    }

    #[tokio::test]
    async fn paywall_callback_is_deferred() {
        let (protection, _, fired) = protection(ReadingLimitDecision::guest());
        let story = StoryRef::Catalog(Uuid::new_v4());

        let result = protection.check_progress(Caller::Guest, story, 0.8).await;

        assert!(!result.allowed);
        assert_eq!(result.progress, 0.30);
        assert!(fired.lock().unwrap().is_empty());

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(fired.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn progress_under_the_ceiling_passes_through() {
        let (protection, _, fired) = protection(ReadingLimitDecision::guest());
        let story = StoryRef::Catalog(Uuid::new_v4());

        let result = protection.check_progress(Caller::Guest, story, 0.2).await;

        assert!(result.allowed);
        assert_eq!(result.progress, 0.2);
        tokio::task::yield_now().await;
        assert!(fired.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn decisions_are_cached_until_invalidated_or_expired() {
        let (protection, gate, _) = protection(ReadingLimitDecision::capped(0.5, "free"));
        let protection = protection.with_ttl(Duration::from_secs(10));
        let caller = Caller::User(Uuid::new_v4());
        let story = StoryRef::Catalog(Uuid::new_v4());

        protection.decision(caller, story).await;
        protection.decision(caller, story).await;
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);

        protection.invalidate();
        protection.decision(caller, story).await;
        assert_eq!(gate.calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        protection.decision(caller, story).await;
        assert_eq!(gate.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_decisions_are_not_cached() {
        let outage = ReadingLimitDecision::capped(0.3, "unverified").into_degraded();
        let (protection, gate, _) = protection(outage);
        let caller = Caller::User(Uuid::new_v4());
        let story = StoryRef::Catalog(Uuid::new_v4());

        assert!(protection.decision(caller, story).await.degraded);

        *gate.decision.lock().unwrap() = ReadingLimitDecision::full("premium");
        let recovered = protection.decision(caller, story).await;
        assert!(recovered.can_read_full);
        protection.decision(caller, story).await;
        assert_eq!(gate.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn personalized_stories_never_reach_the_gate() {
        let (protection, gate, _) = protection(ReadingLimitDecision::guest());
        let story = StoryRef::Personalized(Uuid::new_v4());

        let result = protection.check_progress(Caller::Guest, story, 1.0).await;

        assert!(result.allowed);
        assert_eq!(gate.calls.load(Ordering::SeqCst), 0);
    }
}
