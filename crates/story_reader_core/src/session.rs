//! crates/story_reader_core/src/session.rs
//!
//! Reading sessions follow `NONE -> OPEN -> CLOSED` per (user, story).
//! At most one session is open per pair; opening a second one closes the first.
//! Durations are wall-clock time between open and close, never scroll-derived.
//!
//! Every session belongs to the root `ViewScope` of the connection that opened it,
//! and app-state changes only close the sessions of that owner.

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::{ReadingSession, SessionClosure, StoryRef};
use crate::error::{EngineError, EngineResult};
use crate::events::{AppEvent, AppState};
use crate::ports::{DatabaseService, PortResult};
use crate::scope::ViewScope;

/// Largest accepted `abandoned_cap_seconds` (30 days).
pub const MAX_ABANDONED_CAP_SECONDS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Sessions at least this long count as completed even without reaching the end.
    pub min_completed_seconds: i64,
    /// Upper bound on the duration credited to a reconciled abandoned session.
    pub abandoned_cap_seconds: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_completed_seconds: 30,
            abandoned_cap_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Unmount,
    NavigatedAway,
    Background,
    /// A newer session for the same story replaced this one.
    Superseded,
}

/// The caller's handle to one open session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    session: ReadingSession,
    owner: Uuid,
    finished: AtomicBool,
    closed: AtomicBool,
}

impl SessionHandle {
    fn new(session: ReadingSession, owner: Uuid) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                session,
                owner,
                finished: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.session.id
    }

    pub fn user_id(&self) -> Uuid {
        self.inner.session.user_id
    }

    pub fn story_id(&self) -> Uuid {
        self.inner.session.story_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.session.started_at
    }

    /// The `ViewScope::owner_id` of the scope the session was opened in.
    pub fn owner_id(&self) -> Uuid {
        self.inner.owner
    }

    /// Marks that the reader reached the end of the story during this session.
    pub fn mark_finished(&self) {
        self.inner.finished.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn key(&self) -> (Uuid, Uuid) {
        (self.user_id(), self.story_id())
    }
}

type PairKey = (Uuid, Uuid);

pub struct SessionManager {
    db: Arc<dyn DatabaseService>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    open: Mutex<HashMap<PairKey, SessionHandle>>,
    /// Serializes opens of the same (user, story) pair; other pairs never wait on it.
    pair_locks: Mutex<HashMap<PairKey, Arc<AsyncMutex<()>>>>,
}

impl SessionManager {
    pub fn new(db: Arc<dyn DatabaseService>, clock: Arc<dyn Clock>, config: SessionConfig) -> Self {
        Self {
            db,
            clock,
            config,
            open: Mutex::new(HashMap::new()),
            pair_locks: Mutex::new(HashMap::new()),
        }
    }

    fn open_map(&self) -> MutexGuard<'_, HashMap<PairKey, SessionHandle>> {
        self.open.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pair_locks(&self) -> MutexGuard<'_, HashMap<PairKey, Arc<AsyncMutex<()>>>> {
        self.pair_locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release_pair_lock(&self, key: PairKey, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self.pair_locks();
        drop(lock);
        if locks.get(&key).map_or(false, |l| Arc::strong_count(l) == 1) {
            locks.remove(&key);
        }
    }

    /// Opens a session when a story view mounts with a known user.
    ///
    /// Returns `None` for guests, when the record could not be written, when the
    /// session it replaces could not be closed, or when `scope` closed while the
    /// write was in flight (the record is closed again).
    pub async fn open(
        &self,
        user_id: Option<Uuid>,
        story: StoryRef,
        scope: &ViewScope,
    ) -> Option<SessionHandle> {
        let user_id = user_id?;
        if !scope.is_live() {
            return None;
        }

        let key = (user_id, story.id());
        let lock = self.pair_locks().entry(key).or_default().clone();
        let guard = lock.clone().lock_owned().await;
        let opened = self.open_exclusive(key, story, scope).await;
        drop(guard);
        self.release_pair_lock(key, lock);
        opened
    }

    async fn open_exclusive(
        &self,
        key: PairKey,
        story: StoryRef,
        scope: &ViewScope,
    ) -> Option<SessionHandle> {
        let (user_id, story_id) = key;
        let previous = self.open_map().remove(&key);
        if let Some(previous) = previous {
            if self.finish(&previous, CloseReason::Superseded).await.is_err() {
                warn!(
                    "Keeping session {} open; not starting another for user {} on story {}",
                    previous.id(),
                    user_id,
                    story_id
                );
                self.open_map().entry(key).or_insert(previous);
                return None;
            }
        }

        let session = ReadingSession {
            id: Uuid::new_v4(),
            user_id,
            story_id,
            is_personalized: story.is_personalized(),
            started_at: self.clock.now(),
            ended_at: None,
            duration_seconds: 0,
            completed: false,
        };
        let created = with_one_retry(|| self.db.create_reading_session(session.clone())).await;
        if let Err(e) = created {
            let e = EngineError::SessionWriteFailed {
                session_id: session.id,
                reason: e.to_string(),
            };
            error!("{}", e);
            return None;
        }

        let handle = SessionHandle::new(session, scope.owner_id());
        if !scope.is_live() {
            warn!(
                "View unmounted while session {} was opening; closing it",
                handle.id()
            );
            let _ = self.finish(&handle, CloseReason::Unmount).await;
            return None;
        }

        info!(
            "Opened reading session {} for user {} on story {}",
            handle.id(),
            user_id,
            story_id
        );
        self.open_map().insert(key, handle.clone());
        Some(handle)
    }

    /// Closes `handle`. Closing twice is a no-op that returns `None`, and so is
    /// closing a session that was already closed elsewhere.
    pub async fn close(&self, handle: &SessionHandle, reason: CloseReason) -> Option<ReadingSession> {
        let tracked = {
            let mut open = self.open_map();
            let key = handle.key();
            let tracked = open.get(&key).map(SessionHandle::id) == Some(handle.id());
            if tracked {
                open.remove(&key);
            }
            tracked
        };
        match self.finish(handle, reason).await {
            Ok(closed) => closed,
            Err(_) => {
                if tracked {
                    self.open_map()
                        .entry(handle.key())
                        .or_insert_with(|| handle.clone());
                }
                None
            }
        }
    }

    /// Closes every session opened under scopes with this owner, e.g. when that
    /// connection's app moves to the background.
    pub async fn close_owned_by(&self, owner: Uuid, reason: CloseReason) -> Vec<ReadingSession> {
        let handles: Vec<SessionHandle> = {
            let mut open = self.open_map();
            let keys: Vec<PairKey> = open
                .iter()
                .filter(|(_, handle)| handle.owner_id() == owner)
                .map(|(key, _)| *key)
                .collect();
            keys.iter().filter_map(|key| open.remove(key)).collect()
        };

        let results = join_all(handles.iter().map(|handle| self.finish(handle, reason))).await;
        let mut closed = Vec::new();
        for (handle, result) in handles.into_iter().zip(results) {
            match result {
                Ok(Some(session)) => closed.push(session),
                Ok(None) => {}
                Err(_) => {
                    self.open_map().entry(handle.key()).or_insert(handle);
                }
            }
        }
        closed
    }

    pub fn open_count(&self) -> usize {
        self.open_map().len()
    }

    /// Writes the closure. `Ok(None)` means there was nothing left to close; on
    /// error the handle stays open so a later close can retry.
    async fn finish(
        &self,
        handle: &SessionHandle,
        reason: CloseReason,
    ) -> EngineResult<Option<ReadingSession>> {
        if handle.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }

        let ended_at = self.clock.now();
        let duration_seconds = (ended_at - handle.started_at()).num_seconds().max(0);
        let closure = SessionClosure {
            ended_at,
            duration_seconds,
            completed: handle.inner.finished.load(Ordering::SeqCst)
                || duration_seconds >= self.config.min_completed_seconds,
        };

        let written =
            with_one_retry(|| self.db.close_reading_session(handle.id(), closure.clone())).await;
        match written {
            Ok(true) => {}
            Ok(false) => {
                warn!("Session {} was already closed elsewhere", handle.id());
                return Ok(None);
            }
            Err(e) => {
                handle.inner.closed.store(false, Ordering::SeqCst);
                let e = EngineError::SessionWriteFailed {
                    session_id: handle.id(),
                    reason: e.to_string(),
                };
                error!("{}", e);
                return Err(e);
            }
        }

        info!(
            "Closed reading session {} after {}s ({:?})",
            handle.id(),
            duration_seconds,
            reason
        );
        let mut session = handle.inner.session.clone();
        session.ended_at = Some(closure.ended_at);
        session.duration_seconds = closure.duration_seconds;
        session.completed = closure.completed;
        Ok(Some(session))
    }

    /// Closes sessions a previous run left open without a clean unmount.
    ///
    /// The session ends at the user's last-seen time when that falls after its
    /// start (capped at `abandoned_cap_seconds`), otherwise at its start. Reconciled
    /// sessions never count as completed. Sessions this manager still has open, and
    /// sessions someone else closes first, are skipped.
    pub async fn reconcile_abandoned(&self, user_id: Uuid) -> EngineResult<Vec<ReadingSession>> {
        let user = self.db.get_user(user_id).await?;
        let live: HashSet<Uuid> = self.open_map().values().map(SessionHandle::id).collect();
        let stale = self.db.get_open_sessions(user_id).await?;
        let cap_seconds = self
            .config
            .abandoned_cap_seconds
            .clamp(0, MAX_ABANDONED_CAP_SECONDS);

        let mut reconciled = Vec::new();
        for mut session in stale.into_iter().filter(|s| !live.contains(&s.id)) {
            let cap = session
                .started_at
                .checked_add_signed(Duration::seconds(cap_seconds));
            let ended_at = match user.last_seen_at {
                Some(seen) if seen > session.started_at => cap.map_or(seen, |cap| seen.min(cap)),
                _ => session.started_at,
            };
            let closure = SessionClosure {
                ended_at,
                duration_seconds: (ended_at - session.started_at).num_seconds().max(0),
                completed: false,
            };
            match self
                .db
                .close_reading_session(session.id, closure.clone())
                .await
            {
                Ok(true) => {
                    session.ended_at = Some(closure.ended_at);
                    session.duration_seconds = closure.duration_seconds;
                    session.completed = false;
                    reconciled.push(session);
                }
                Ok(false) => {}
                Err(e) => warn!("Could not reconcile session {}: {}", session.id, e),
            }
        }

        if !reconciled.is_empty() {
            info!(
                "Reconciled {} abandoned sessions for user {}",
                reconciled.len(),
                user_id
            );
        }
        Ok(reconciled)
    }

    /// Closes the sessions opened under `scope` (or its children) whenever the app
    /// behind it moves to the background. Closed sessions are forwarded on the
    /// returned channel.
    pub fn watch_app_state(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<AppEvent>,
        scope: &ViewScope,
    ) -> mpsc::UnboundedReceiver<ReadingSession> {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = self.clone();
        let owner = scope.owner_id();
        scope.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(AppEvent::AppState {
                        to: AppState::Background,
                        ..
                    }) => {
                        for session in manager.close_owned_by(owner, CloseReason::Background).await {
                            if tx.send(session).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Session watcher skipped {} app events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }
}

async fn with_one_retry<T, F, Fut>(mut op: F) -> PortResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PortResult<T>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(first) => {
            warn!("Session write failed, retrying once: {}", first);
            op().await
        }
    }
}
