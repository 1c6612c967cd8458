//! services/api/src/adapters/auth.rs
//!
//! Cookie-based access to the auth provider's login sessions. Accounts and
//! credentials live with the provider; this adapter only validates and extends
//! the session a client presents.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use story_reader_core::clock::Clock;
use story_reader_core::domain::AuthSession;
use story_reader_core::ports::{AuthService, PortError, PortResult};
use tracing::debug;
use uuid::Uuid;

/// Name of the cookie carrying the login session token.
pub const SESSION_COOKIE: &str = "session";

/// How far a refresh pushes the expiry out.
const SESSION_TTL_DAYS: i64 = 30;

/// Storage for login sessions issued by the auth provider.
#[async_trait]
pub trait AuthSessionStore: Send + Sync {
    async fn find_auth_session(&self, token: &str) -> PortResult<Option<AuthSession>>;

    async fn extend_auth_session(
        &self,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> PortResult<AuthSession>;
}

/// Pulls the session token out of a `Cookie` header.
pub fn session_token(cookie_header: &str) -> Option<&str> {
    cookie_header.split(';').find_map(|c| {
        c.trim()
            .strip_prefix(SESSION_COOKIE)
            .and_then(|rest| rest.strip_prefix('='))
            .filter(|token| !token.is_empty())
    })
}

/// The auth port for one client connection.
pub struct CookieAuth {
    store: Arc<dyn AuthSessionStore>,
    clock: Arc<dyn Clock>,
    token: Option<String>,
}

impl CookieAuth {
    pub fn new(store: Arc<dyn AuthSessionStore>, clock: Arc<dyn Clock>, token: Option<String>) -> Self {
        Self { store, clock, token }
    }

    async fn live_session(&self) -> PortResult<Option<AuthSession>> {
        let Some(token) = self.token.as_deref() else {
            return Ok(None);
        };
        let now = self.clock.now();
        Ok(self
            .store
            .find_auth_session(token)
            .await?
            .filter(|session| session.expires_at > now))
    }
}

#[async_trait]
impl AuthService for CookieAuth {
    async fn get_session(&self) -> PortResult<Option<AuthSession>> {
        self.live_session().await
    }

    async fn refresh_session(&self) -> PortResult<AuthSession> {
        let session = self.live_session().await?.ok_or(PortError::Unauthorized)?;
        let expires_at = self.clock.now() + Duration::days(SESSION_TTL_DAYS);
        debug!("Extending auth session for user {}", session.user_id);
        self.store.extend_auth_session(&session.id, expires_at).await
    }

    async fn current_user_id(&self) -> PortResult<Option<Uuid>> {
        Ok(self.live_session().await?.map(|session| session.user_id))
    }
}

/// Login sessions held in memory, for tests and local runs without Postgres.
#[derive(Default)]
pub struct MemoryAuthSessions {
    sessions: Mutex<HashMap<String, AuthSession>>,
}

impl MemoryAuthSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: AuthSession) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session.id.clone(), session);
    }
}

#[async_trait]
impl AuthSessionStore for MemoryAuthSessions {
    async fn find_auth_session(&self, token: &str) -> PortResult<Option<AuthSession>> {
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(token)
            .cloned())
    }

    async fn extend_auth_session(
        &self,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> PortResult<AuthSession> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let session = sessions.get_mut(token).ok_or(PortError::Unauthorized)?;
        session.expires_at = expires_at;
        Ok(session.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use story_reader_core::clock::ManualClock;

    fn setup(expires_in: Duration) -> (Arc<MemoryAuthSessions>, Arc<ManualClock>, Uuid) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryAuthSessions::new());
        let user_id = Uuid::new_v4();
        store.insert(AuthSession {
            id: "abc".to_string(),
            user_id,
            expires_at: clock.now() + expires_in,
        });
        (store, clock, user_id)
    }

    #[test]
    fn token_is_read_from_the_cookie_header() {
        assert_eq!(session_token("theme=dark; session=abc"), Some("abc"));
        assert_eq!(session_token("session=abc;other=1"), Some("abc"));
        assert_eq!(session_token("sessionid=abc"), None);
        assert_eq!(session_token("session="), None);
    }

    #[tokio::test]
    async fn live_session_resolves_the_user() {
        let (store, clock, user_id) = setup(Duration::hours(1));
        let auth = CookieAuth::new(store, clock, Some("abc".to_string()));

        assert_eq!(auth.current_user_id().await.unwrap(), Some(user_id));
    }

    #[tokio::test]
    async fn expired_or_missing_sessions_cannot_refresh() {
        let (store, clock, _) = setup(Duration::hours(1));
        clock.advance(Duration::hours(2));

        let expired = CookieAuth::new(store.clone(), clock.clone(), Some("abc".to_string()));
        assert!(expired.get_session().await.unwrap().is_none());
        assert!(matches!(
            expired.refresh_session().await,
            Err(PortError::Unauthorized)
        ));

        let anonymous = CookieAuth::new(store, clock, None);
        assert!(matches!(
            anonymous.refresh_session().await,
            Err(PortError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn refresh_extends_the_expiry() {
        let (store, clock, _) = setup(Duration::minutes(5));
        let auth = CookieAuth::new(store, clock.clone(), Some("abc".to_string()));

        let refreshed = auth.refresh_session().await.unwrap();
        assert_eq!(refreshed.expires_at, clock.now() + Duration::days(SESSION_TTL_DAYS));
    }
}
