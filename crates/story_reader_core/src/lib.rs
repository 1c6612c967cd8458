pub mod achievements;
pub mod clock;
pub mod domain;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod gate;
pub mod memory;
pub mod ports;
pub mod protection;
pub mod refresh;
pub mod scope;
pub mod session;
pub mod stats;
pub mod tracker;

pub use achievements::{AchievementEngine, AchievementRules};
pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::{
    AchievementGrant, AuthSession, Caller, GenerationAllowance, PersonalizedStory,
    ReadingLimitDecision, ReadingSession, ReadingStats, SessionClosure, Story, StoryRef,
    StreakData, Tier, UsageCounters, UsageLimits, User, GUEST_MAX_PROGRESS,
};
pub use entitlement::{EntitlementResolver, TierLimits, TierTable};
pub use error::{EngineError, EngineResult};
pub use events::{AppEvent, AppState, EventRegistry, NetworkStatus};
pub use gate::{ProgressGate, ReadingGate};
pub use ports::{
    AuthService, DailyStoryService, DatabaseService, EntitlementOracle, PortError, PortResult,
    ViewSink,
};
pub use protection::{PaywallCallback, ProgressProtection, ProtectedProgress};
pub use refresh::{DataRefresh, RefreshConfig, RefreshCoordinator, RefreshOutcome};
pub use scope::ViewScope;
pub use session::{CloseReason, SessionConfig, SessionHandle, SessionManager};
pub use stats::StatsAggregator;
pub use tracker::{ScrollGeometry, ScrollOutcome, ScrollTracker, TrackerConfig};
