//! crates/story_reader_core/src/scope.rs
//!
//! A `ViewScope` owns every deferred callback of one mounted story view.
//! Closing the scope cancels its token and aborts all pending timers, so no
//! callback can touch view state after teardown.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Clone)]
pub struct ViewScope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    token: CancellationToken,
    owner: Uuid,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        self.token.cancel();
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Default for ViewScope {
    fn default() -> Self {
        Self::with_token(CancellationToken::new(), Uuid::new_v4())
    }
}

impl ViewScope {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_token(token: CancellationToken, owner: Uuid) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                token,
                owner,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A scope that is closed together with this one, but can also be closed on its own.
    pub fn child(&self) -> ViewScope {
        Self::with_token(self.inner.token.child_token(), self.inner.owner)
    }

    /// Identifies the root scope; every `child` reports the same id as its parent.
    pub fn owner_id(&self) -> Uuid {
        self.inner.owner
    }

    pub fn is_live(&self) -> bool {
        !self.inner.token.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Runs `f` after `delay` unless the scope closes first.
    /// Returns `false` if the scope is already closed.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        })
    }

    /// Runs `f` on a later scheduler tick, never inline with the caller.
    pub fn defer<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(async move {
            tokio::task::yield_now().await;
            f();
        })
    }

    /// Drives `fut` until it finishes or the scope closes, whichever comes first.
    pub fn spawn<Fut>(&self, fut: Fut) -> bool
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !self.is_live() {
            return false;
        }
        let token = self.inner.token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = fut => {}
            }
        });

        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        true
    }

    pub fn pending(&self) -> usize {
        let tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.iter().filter(|task| !task.is_finished()).count()
    }

    /// Cancels the scope and aborts every pending callback. Idempotent.
    pub fn close(&self) {
        self.inner.token.cancel();
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn scheduled_callback_fires_after_delay() {
        let scope = ViewScope::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        assert!(scope.schedule(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_callbacks() {
        let scope = ViewScope::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        scope.schedule(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        scope.close();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!scope.is_live());
        assert!(!scope.schedule(Duration::ZERO, || {}));
    }

    #[tokio::test(start_paused = true)]
    async fn closing_parent_closes_child() {
        let parent = ViewScope::new();
        let child = parent.child();
        parent.close();
        assert!(!child.is_live());
    }

    #[test]
    fn children_share_their_root_owner() {
        let root = ViewScope::new();
        let grandchild = root.child().child();
        assert_eq!(grandchild.owner_id(), root.owner_id());
        assert_ne!(ViewScope::new().owner_id(), root.owner_id());
    }

    #[tokio::test]
    async fn deferred_callback_does_not_run_inline() {
        let scope = ViewScope::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        scope.defer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
