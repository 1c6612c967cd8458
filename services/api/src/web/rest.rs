//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::web::state::{AppState, Identity};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    Extension,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use story_reader_core::achievements;
use story_reader_core::domain::{
    GenerationAllowance, ReadingLimitDecision, ReadingStats, StoryRef, Tier, UsageLimits,
};
use story_reader_core::error::EngineError;
use story_reader_core::gate::ReadingGate;
use story_reader_core::ports::PortError;
use tracing::error;
use utoipa::{IntoParams, OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        limits_handler,
        stats_handler,
        achievements_handler,
        reading_limit_handler,
    ),
    components(
        schemas(LimitsResponse, StatsResponse, AchievementResponse, ReadingLimitResponse)
    ),
    tags(
        (name = "Story Reader API", description = "Reading entitlements, progress limits and reading statistics.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

/// A snapshot of the caller's consumption against their tier.
#[derive(Serialize, ToSchema)]
pub struct LimitsResponse {
    tier: String,
    /// `daily`, `lifetime` or `unlimited`.
    generation_cap: String,
    generations_used: u32,
    generation_limit: Option<u32>,
    can_generate: bool,
    monthly_audio_used: u32,
    monthly_audio_limit: Option<u32>,
    remaining_audio_seconds: Option<u32>,
    max_story_progress: f64,
    daily_resets_at: DateTime<Utc>,
    monthly_resets_at: DateTime<Utc>,
}

impl From<UsageLimits> for LimitsResponse {
    fn from(limits: UsageLimits) -> Self {
        let (generation_cap, generations_used, generation_limit) = match limits.generation_allowance() {
            GenerationAllowance::Daily { used, limit, .. } => ("daily", used, Some(limit)),
            GenerationAllowance::Lifetime { used, limit } => ("lifetime", used, Some(limit)),
            GenerationAllowance::Unlimited => ("unlimited", limits.lifetime_used, None),
        };
        Self {
            tier: match limits.tier {
                Tier::Free => "free",
                Tier::Premium => "premium",
            }
            .to_string(),
            generation_cap: generation_cap.to_string(),
            generations_used,
            generation_limit,
            can_generate: limits.can_generate(),
            monthly_audio_used: limits.monthly_audio_used,
            monthly_audio_limit: limits.monthly_audio_limit,
            remaining_audio_seconds: limits.remaining_audio_seconds(),
            max_story_progress: limits.max_story_progress,
            daily_resets_at: limits.daily_resets_at,
            monthly_resets_at: limits.monthly_resets_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct StatsResponse {
    total_sessions: u32,
    completed_sessions: u32,
    total_reading_seconds: i64,
    average_session_seconds: i64,
    stories_completed: u32,
    current_streak: u32,
    longest_streak: u32,
    last_active_date: Option<NaiveDate>,
}

impl From<ReadingStats> for StatsResponse {
    fn from(stats: ReadingStats) -> Self {
        Self {
            total_sessions: stats.total_sessions,
            completed_sessions: stats.completed_sessions,
            total_reading_seconds: stats.total_reading_seconds,
            average_session_seconds: stats.average_session_seconds,
            stories_completed: stats.stories_completed,
            current_streak: stats.current_streak,
            longest_streak: stats.longest_streak,
            last_active_date: stats.last_active_date,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct AchievementResponse {
    achievement_id: String,
    name: String,
    description: String,
    unlocked_at: DateTime<Utc>,
}

#[derive(Serialize, ToSchema)]
pub struct ReadingLimitResponse {
    story_id: Uuid,
    can_read_full: bool,
    max_progress_allowed: f64,
    reason: String,
}

impl ReadingLimitResponse {
    fn new(story_id: Uuid, decision: ReadingLimitDecision) -> Self {
        Self {
            story_id,
            can_read_full: decision.can_read_full,
            max_progress_allowed: decision.max_progress_allowed,
            reason: decision.reason,
        }
    }
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ReadingLimitQuery {
    /// Whether the id refers to a personalized story.
    #[serde(default)]
    personalized: bool,
}

type HandlerError = (StatusCode, String);

fn require_user(identity: &Identity) -> Result<Uuid, HandlerError> {
    identity
        .caller
        .user_id()
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "Sign in required".to_string()))
}

fn engine_error(context: &str, e: EngineError) -> HandlerError {
    error!("{}: {}", context, e);
    match e {
        EngineError::EntitlementUnavailable(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Subscription status is temporarily unavailable".to_string(),
        ),
        EngineError::Port(PortError::NotFound(_)) => (StatusCode::NOT_FOUND, "Not found".to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, context.to_string()),
    }
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Current usage and limits for the signed-in user.
#[utoipa::path(
    get,
    path = "/limits",
    responses(
        (status = 200, description = "Current limits", body = LimitsResponse),
        (status = 401, description = "Not signed in"),
        (status = 503, description = "Subscription status unavailable")
    )
)]
pub async fn limits_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<LimitsResponse>, HandlerError> {
    let user_id = require_user(&identity)?;
    let limits = app_state
        .resolver
        .get_usage_limits(user_id)
        .await
        .map_err(|e| engine_error("Failed to load limits", e))?;
    Ok(Json(limits.into()))
}

/// Reading statistics derived from the signed-in user's session history.
#[utoipa::path(
    get,
    path = "/stats",
    responses(
        (status = 200, description = "Reading statistics", body = StatsResponse),
        (status = 401, description = "Not signed in")
    )
)]
pub async fn stats_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<StatsResponse>, HandlerError> {
    let user_id = require_user(&identity)?;
    let stats = app_state
        .stats
        .stats(user_id)
        .await
        .map_err(|e| engine_error("Failed to load stats", e))?;
    Ok(Json(stats.into()))
}

/// Achievements the signed-in user has unlocked, oldest first.
#[utoipa::path(
    get,
    path = "/achievements",
    responses(
        (status = 200, description = "Unlocked achievements", body = [AchievementResponse]),
        (status = 401, description = "Not signed in")
    )
)]
pub async fn achievements_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<AchievementResponse>>, HandlerError> {
    let user_id = require_user(&identity)?;
    let grants = app_state
        .achievements
        .list(user_id)
        .await
        .map_err(|e| engine_error("Failed to load achievements", e))?;

    let response = grants
        .into_iter()
        .map(|grant| {
            let (name, description) = achievements::definition(&grant.achievement_id)
                .map(|d| (d.name.to_string(), d.description.to_string()))
                .unwrap_or_else(|| (grant.achievement_id.clone(), String::new()));
            AchievementResponse {
                achievement_id: grant.achievement_id,
                name,
                description,
                unlocked_at: grant.unlocked_at,
            }
        })
        .collect();
    Ok(Json(response))
}

/// How far the caller may read a story. Guests are answered too.
#[utoipa::path(
    get,
    path = "/stories/{id}/reading-limit",
    params(
        ("id" = Uuid, Path, description = "The story id."),
        ReadingLimitQuery
    ),
    responses(
        (status = 200, description = "The reading limit decision", body = ReadingLimitResponse)
    )
)]
pub async fn reading_limit_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(story_id): Path<Uuid>,
    Query(query): Query<ReadingLimitQuery>,
) -> Json<ReadingLimitResponse> {
    let story = if query.personalized {
        StoryRef::Personalized(story_id)
    } else {
        StoryRef::Catalog(story_id)
    };
    let decision = app_state
        .gate
        .check_reading_limit(identity.caller, story)
        .await;
    Json(ReadingLimitResponse::new(story_id, decision))
}
