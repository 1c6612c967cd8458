pub mod middleware;
pub mod protocol;
pub mod reader_task;
pub mod rest;
pub mod state;
pub mod ws_handler;

// Re-export the main WebSocket handler to make it easily accessible
// to the binary that will build the web server router.
pub use middleware::identify;
pub use rest::{achievements_handler, limits_handler, reading_limit_handler, stats_handler};
pub use ws_handler::ws_handler;

use axum::{middleware as axum_middleware, routing::get, Router};
use state::AppState;
use std::sync::Arc;

/// Builds the API routes. Every route runs behind `identify`, so handlers always
/// see an `Identity`, guest or signed in.
pub fn router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/limits", get(limits_handler))
        .route("/stats", get(stats_handler))
        .route("/achievements", get(achievements_handler))
        .route("/stories/{id}/reading-limit", get(reading_limit_handler))
        .route("/ws", get(ws_handler))
        .layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            identify,
        ))
        .with_state(app_state)
}
