//! crates/story_reader_core/src/refresh.rs
//!
//! Re-validates the auth session and then refreshes caller data when the app
//! returns to the foreground, the network comes back, the locale changes, or a
//! declared dependency changes. At most one refresh runs at a time, and none starts within
//! `min_interval` of the previous one finishing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::events::{AppEvent, AppState, NetworkStatus};
use crate::ports::AuthService;
use crate::scope::ViewScope;

/// The caller-supplied data refresh, run after a successful auth refresh.
#[async_trait]
pub trait DataRefresh: Send + Sync {
    async fn refresh_data(&self) -> EngineResult<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshConfig {
    pub min_interval: Duration,
    /// Pause between the auth refresh and the data refresh.
    pub settle_delay: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(5),
            settle_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    SkippedInFlight,
    SkippedRateLimited,
    AuthFailed,
    DataFailed,
}

pub struct RefreshCoordinator {
    auth: Arc<dyn AuthService>,
    data: Arc<dyn DataRefresh>,
    config: RefreshConfig,
    in_flight: AtomicBool,
    last_completed: Mutex<Option<Instant>>,
    last_network: Mutex<Option<NetworkStatus>>,
    runs: AtomicU64,
}

/// Clears the in-flight flag even if the refresh future is dropped mid-way.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl RefreshCoordinator {
    pub fn new(auth: Arc<dyn AuthService>, data: Arc<dyn DataRefresh>, config: RefreshConfig) -> Self {
        Self {
            auth,
            data,
            config,
            in_flight: AtomicBool::new(false),
            last_completed: Mutex::new(None),
            last_network: Mutex::new(None),
            runs: AtomicU64::new(0),
        }
    }

    /// How many refreshes actually executed (skipped calls are not counted).
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    fn rate_limited(&self) -> bool {
        let last = *self.last_completed.lock().unwrap_or_else(|e| e.into_inner());
        last.map_or(false, |at| at.elapsed() < self.config.min_interval)
    }

    pub async fn refresh(&self) -> RefreshOutcome {
        if self.rate_limited() {
            debug!("Refresh suppressed by rate limit");
            return RefreshOutcome::SkippedRateLimited;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Refresh already in flight");
            return RefreshOutcome::SkippedInFlight;
        }
        let _in_flight = InFlight(&self.in_flight);
        self.runs.fetch_add(1, Ordering::SeqCst);

        let outcome = self.run().await;
        *self.last_completed.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        outcome
    }

    async fn run(&self) -> RefreshOutcome {
        match self.auth.refresh_session().await {
            Ok(session) => {
                info!("Auth session refreshed for user {}", session.user_id);
            }
            Err(e) => {
                let e = EngineError::AuthRefreshFailed(e.to_string());
                error!("{}; skipping data refresh", e);
                return RefreshOutcome::AuthFailed;
            }
        }

        tokio::time::sleep(self.config.settle_delay).await;

        match self.data.refresh_data().await {
            Ok(()) => RefreshOutcome::Refreshed,
            Err(e) => {
                warn!("Data refresh failed: {}", e);
                RefreshOutcome::DataFailed
            }
        }
    }

    /// Runs a refresh if `event` is one of the triggers, and returns its outcome.
    pub async fn handle_event(&self, event: &AppEvent) -> Option<RefreshOutcome> {
        let triggered = match event {
            AppEvent::AppState { from, to } => {
                *from == AppState::Background && *to == AppState::Active
            }
            AppEvent::Network(status) => {
                let mut last = self.last_network.lock().unwrap_or_else(|e| e.into_inner());
                let previous = last.replace(*status);
                status.is_online() && previous.map_or(false, |prev| !prev.is_online())
            }
            // Reset times are computed in the caller's locale.
            AppEvent::LocaleChanged(_) | AppEvent::DependenciesChanged => true,
        };

        if triggered {
            Some(self.refresh().await)
        } else {
            None
        }
    }

    /// Feeds app events from `events` into `handle_event` until the scope closes.
    pub fn watch(self: &Arc<Self>, mut events: broadcast::Receiver<AppEvent>, scope: &ViewScope) {
        let coordinator = self.clone();
        scope.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(outcome) = coordinator.handle_event(&event).await {
                            debug!("Refresh after {:?}: {:?}", event, outcome);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Refresh watcher skipped {} app events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}
