//! services/api/src/web/middleware.rs
//!
//! Authentication middleware. Every route is open to guests, so a missing or
//! expired session downgrades the request to a guest instead of rejecting it.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use story_reader_core::domain::Caller;
use tracing::{debug, error};

use crate::adapters::auth::session_token;
use crate::web::state::{AppState, Identity};

/// Middleware that resolves the auth session cookie into an `Identity`.
///
/// The identity is inserted into request extensions for handlers to use.
pub async fn identify(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(session_token)
        .map(str::to_string);

    let identity = match token {
        Some(token) => resolve(&state, token).await,
        None => Identity::guest(),
    };
    req.extensions_mut().insert(identity);

    next.run(req).await
}

async fn resolve(state: &AppState, token: String) -> Identity {
    match state.auth_sessions.find_auth_session(&token).await {
        Ok(Some(session)) if session.expires_at > state.clock.now() => Identity {
            caller: Caller::User(session.user_id),
            token: Some(token),
        },
        Ok(_) => {
            debug!("Session cookie is unknown or expired; continuing as guest");
            Identity::guest()
        }
        Err(e) => {
            error!("Failed to validate auth session: {:?}", e);
            Identity::guest()
        }
    }
}
