//! services/api/src/web/state.rs
//!
//! Defines the application's shared and connection-specific states.

use crate::adapters::auth::{AuthSessionStore, CookieAuth};
use crate::config::Config;
use crate::web::protocol::ServerMessage;
use async_trait::async_trait;
use std::sync::Arc;
use story_reader_core::achievements::AchievementEngine;
use story_reader_core::clock::Clock;
use story_reader_core::domain::{Caller, StoryRef};
use story_reader_core::entitlement::EntitlementResolver;
use story_reader_core::error::EngineResult;
use story_reader_core::events::{AppState as AppLifecycle, EventRegistry};
use story_reader_core::gate::ProgressGate;
use story_reader_core::ports::{DailyStoryService, DatabaseService, EntitlementOracle, ViewSink};
use story_reader_core::protection::ProgressProtection;
use story_reader_core::refresh::{DataRefresh, RefreshCoordinator};
use story_reader_core::scope::ViewScope;
use story_reader_core::session::{SessionHandle, SessionManager};
use story_reader_core::stats::StatsAggregator;
use story_reader_core::tracker::ScrollTracker;
use tokio::sync::mpsc;
use tracing::debug;

//=========================================================================================
// AppState (Shared Across All Connections)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn DatabaseService>,
    pub auth_sessions: Arc<dyn AuthSessionStore>,
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,
    pub resolver: Arc<EntitlementResolver>,
    pub gate: Arc<ProgressGate>,
    pub sessions: Arc<SessionManager>,
    pub stats: Arc<StatsAggregator>,
    pub achievements: Arc<AchievementEngine>,
}

impl AppState {
    /// Wires the engine components on top of the given ports.
    pub fn new(
        db: Arc<dyn DatabaseService>,
        oracle: Arc<dyn EntitlementOracle>,
        schedule: Arc<dyn DailyStoryService>,
        auth_sessions: Arc<dyn AuthSessionStore>,
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let resolver = Arc::new(EntitlementResolver::new(
            db.clone(),
            oracle,
            config.tiers.clone(),
            clock.clone(),
        ));
        let gate = Arc::new(ProgressGate::new(schedule, resolver.clone(), clock.clone()));
        let sessions = Arc::new(SessionManager::new(
            db.clone(),
            clock.clone(),
            config.session.clone(),
        ));
        let stats = Arc::new(StatsAggregator::new(db.clone(), clock.clone()));
        let achievements = Arc::new(AchievementEngine::new(db.clone(), clock.clone()));

        Self {
            db,
            auth_sessions,
            config,
            clock,
            resolver,
            gate,
            sessions,
            stats,
            achievements,
        }
    }
}

//=========================================================================================
// ReaderContext (Specific to One WebSocket Connection)
//=========================================================================================

/// Who is on the other end of a connection, as resolved by the auth middleware.
#[derive(Debug, Clone)]
pub struct Identity {
    pub caller: Caller,
    /// The login session token, kept so the connection can refresh it later.
    pub token: Option<String>,
}

impl Identity {
    pub fn guest() -> Self {
        Self {
            caller: Caller::Guest,
            token: None,
        }
    }
}

/// Forwards view signals to the client as protocol messages.
pub struct ChannelSink {
    outbound: mpsc::UnboundedSender<ServerMessage>,
}

impl ChannelSink {
    pub fn new(outbound: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { outbound }
    }

    fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).is_err() {
            debug!("Dropping view signal; the connection is gone");
        }
    }
}

impl ViewSink for ChannelSink {
    fn progress(&self, fraction: f64) {
        self.send(ServerMessage::Progress { progress: fraction });
    }

    fn paywall(&self, message: &str) {
        self.send(ServerMessage::Paywall {
            message: message.to_string(),
        });
    }

    fn scroll_to(&self, offset: f64) {
        self.send(ServerMessage::ScrollTo { offset });
    }
}

/// The data half of a refresh: drop cached decisions, then push fresh limits.
struct LimitsRefresh {
    caller: Caller,
    resolver: Arc<EntitlementResolver>,
    protection: Arc<ProgressProtection>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
}

#[async_trait]
impl DataRefresh for LimitsRefresh {
    async fn refresh_data(&self) -> EngineResult<()> {
        self.protection.invalidate();
        let limits = match self.caller.user_id() {
            Some(user_id) => Some(self.resolver.get_usage_limits(user_id).await?),
            None => None,
        };
        let _ = self.outbound.send(ServerMessage::LimitsRefreshed { limits });
        Ok(())
    }
}

/// One mounted story view on a connection.
pub struct OpenView {
    pub story: StoryRef,
    pub tracker: Arc<ScrollTracker>,
    pub session: Option<SessionHandle>,
    /// Child of the connection scope; closed when the view unmounts.
    pub scope: ViewScope,
}

/// The state for a single, active WebSocket connection.
pub struct ReaderContext {
    pub app: Arc<AppState>,
    pub caller: Caller,
    pub events: EventRegistry,
    /// Owns every task and timer spawned for this connection.
    pub scope: ViewScope,
    pub protection: Arc<ProgressProtection>,
    pub refresh: Arc<RefreshCoordinator>,
    pub outbound: mpsc::UnboundedSender<ServerMessage>,
    pub view: Option<OpenView>,
    pub lifecycle: AppLifecycle,
}

//=========================================================================================
// ReaderContext Implementation (Constructor)
//=========================================================================================

impl ReaderContext {
    pub fn new(
        app: Arc<AppState>,
        identity: Identity,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        let scope = ViewScope::new();
        let paywall_outbound = outbound.clone();
        let protection = Arc::new(ProgressProtection::new(
            app.gate.clone(),
            scope.clone(),
            Arc::new(move |message| {
                let _ = paywall_outbound.send(ServerMessage::Paywall { message });
            }),
        ));

        let auth = Arc::new(CookieAuth::new(
            app.auth_sessions.clone(),
            app.clock.clone(),
            identity.token,
        ));
        let data = Arc::new(LimitsRefresh {
            caller: identity.caller,
            resolver: app.resolver.clone(),
            protection: protection.clone(),
            outbound: outbound.clone(),
        });
        let refresh = Arc::new(RefreshCoordinator::new(
            auth,
            data,
            app.config.refresh.clone(),
        ));

        Self {
            app,
            caller: identity.caller,
            events: EventRegistry::new(),
            scope,
            protection,
            refresh,
            outbound,
            view: None,
            lifecycle: AppLifecycle::Active,
        }
    }

    /// Queues a message for the client. Returns false once the connection is gone.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.outbound.send(message).is_ok()
    }
}
