//! services/api/src/web/reader_task.rs
//!
//! The per-connection reading flow: opening and closing story views, feeding
//! scroll events to the tracker, forwarding app lifecycle events and granting
//! achievements when a session closes.

use crate::web::protocol::ServerMessage;
use crate::web::state::{ChannelSink, OpenView, ReaderContext};
use std::sync::Arc;
use story_reader_core::achievements::{self, AchievementRules};
use story_reader_core::domain::{ReadingSession, StoryRef, PROGRESS_EPSILON};
use story_reader_core::events::{AppEvent, AppState as AppLifecycle, NetworkStatus};
use story_reader_core::ports::PortError;
use story_reader_core::session::CloseReason;
use story_reader_core::tracker::{ScrollGeometry, ScrollOutcome, ScrollTracker};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

impl ReaderContext {
    /// Reconciles sessions a previous connection left open and starts the event watchers.
    /// Returns the channel of sessions closed because the app went to the background.
    pub async fn start(&mut self) -> Option<mpsc::UnboundedReceiver<ReadingSession>> {
        if let Some(user_id) = self.caller.user_id() {
            if let Err(e) = self.app.sessions.reconcile_abandoned(user_id).await {
                warn!("Could not reconcile sessions for user {}: {}", user_id, e);
            }
        }

        if let Some(events) = self.events.subscribe() {
            self.refresh.watch(events, &self.scope);
        }
        self.caller.user_id()?;
        let events = self.events.subscribe()?;
        Some(self.app.sessions.watch_app_state(events, &self.scope))
    }

    pub async fn open_story(&mut self, story_id: Uuid, personalized: bool) {
        self.close_story(CloseReason::NavigatedAway).await;

        let story = if personalized {
            StoryRef::Personalized(story_id)
        } else {
            StoryRef::Catalog(story_id)
        };
        if let Err(message) = self.verify_story(story).await {
            self.send(ServerMessage::Error { message });
            return;
        }

        let scope = self.scope.child();
        let tracker = Arc::new(ScrollTracker::new(
            self.caller,
            story,
            self.protection.clone(),
            self.app.db.clone(),
            Arc::new(ChannelSink::new(self.outbound.clone())),
            scope.clone(),
            self.app.config.tracker.clone(),
        ));
        let session = self
            .app
            .sessions
            .open(self.caller.user_id(), story, &scope)
            .await;
        tracker.load_saved_progress().await;

        let decision = self.protection.decision(self.caller, story).await;
        let saved_progress = match tracker.saved_progress() {
            Some(saved) => Some(
                self.protection
                    .check_progress(self.caller, story, saved)
                    .await
                    .progress,
            ),
            None => None,
        };

        info!("Story {} opened by {:?}", story_id, self.caller);
        self.send(ServerMessage::StoryOpened {
            story_id,
            decision,
            saved_progress,
            session_id: session.as_ref().map(|s| s.id()),
        });
        self.view = Some(OpenView {
            story,
            tracker,
            session,
            scope,
        });
    }

    /// Personalized stories are readable only by their owner.
    async fn verify_story(&self, story: StoryRef) -> Result<(), String> {
        let found = match story {
            StoryRef::Catalog(id) => self.app.db.get_story(id).await.map(|_| ()),
            StoryRef::Personalized(id) => {
                self.app
                    .db
                    .get_personalized_story(id)
                    .await
                    .and_then(|owned| match self.caller.user_id() {
                        Some(user_id) if user_id == owned.owner_id => Ok(()),
                        _ => Err(PortError::NotFound(format!("Personalized story {}", id))),
                    })
            }
        };
        found.map_err(|e| match e {
            PortError::NotFound(_) => "Story not found.".to_string(),
            e => {
                error!("Failed to load story {}: {}", story.id(), e);
                "Failed to load story.".to_string()
            }
        })
    }

    pub fn layout(&self, content_height: f64, viewport_height: f64) {
        if let Some(view) = &self.view {
            view.tracker.on_layout(content_height, viewport_height);
        }
    }

    pub async fn scroll(&self, geometry: ScrollGeometry) -> Option<ScrollOutcome> {
        let Some(view) = &self.view else {
            self.send(ServerMessage::Error {
                message: "No story is open.".to_string(),
            });
            return None;
        };

        let writes = view.tracker.writes();
        let outcome = view.tracker.on_scroll(geometry).await;
        if let Some(progress) = outcome.progress() {
            if progress >= 1.0 - PROGRESS_EPSILON {
                if let Some(session) = &view.session {
                    session.mark_finished();
                }
            }
        }
        if view.tracker.writes() > writes {
            if let Some(user_id) = self.caller.user_id() {
                if let Err(e) = self.app.db.touch_last_seen(user_id, self.app.clock.now()).await {
                    warn!("Could not stamp last-seen for user {}: {}", user_id, e);
                }
            }
        }
        Some(outcome)
    }

    pub async fn app_state(&mut self, to: AppLifecycle) {
        let from = std::mem::replace(&mut self.lifecycle, to);
        if from == to {
            return;
        }
        self.events.publish(AppEvent::AppState { from, to });

        if from == AppLifecycle::Background && to == AppLifecycle::Active {
            self.resume_session().await;
        }
    }

    /// Starts a fresh session for the open view after the previous one was closed
    /// by backgrounding.
    async fn resume_session(&mut self) {
        let Some(view) = self.view.as_mut() else {
            return;
        };
        if view.session.as_ref().map_or(false, |s| !s.is_closed()) {
            return;
        }
        view.session = self
            .app
            .sessions
            .open(self.caller.user_id(), view.story, &view.scope)
            .await;
    }

    pub fn network(&self, connected: bool, internet_reachable: bool) {
        self.events.publish(AppEvent::Network(NetworkStatus {
            connected,
            internet_reachable,
        }));
    }

    pub fn locale_changed(&self, locale: String) {
        self.events.publish(AppEvent::LocaleChanged(locale));
    }

    pub fn dependencies_changed(&self) {
        self.events.publish(AppEvent::DependenciesChanged);
    }

    pub async fn close_story(&mut self, reason: CloseReason) {
        let Some(view) = self.view.take() else {
            return;
        };
        view.tracker.close();
        if let Some(handle) = &view.session {
            if let Some(closed) = self.app.sessions.close(handle, reason).await {
                self.session_closed(closed).await;
            }
        }
        view.scope.close();
    }

    /// Reports a closed session and grants whatever it unlocked.
    pub async fn session_closed(&self, session: ReadingSession) {
        self.send(ServerMessage::SessionClosed {
            session_id: session.id,
            duration_seconds: session.duration_seconds,
            completed: session.completed,
        });

        let user_id = session.user_id;
        let evaluated = async {
            let user = self.app.db.get_user(user_id).await?;
            let stats = self.app.stats.stats(user_id).await?;
            Ok::<_, story_reader_core::error::EngineError>(AchievementRules::earned(
                &stats,
                Some(&session),
                user.offset(),
            ))
        }
        .await;

        let earned = match evaluated {
            Ok(earned) => earned,
            Err(e) => {
                warn!("Skipping achievements for user {}: {}", user_id, e);
                return;
            }
        };
        for id in self.app.achievements.grant_all(user_id, &earned).await {
            if let Some(definition) = achievements::definition(&id) {
                self.send(ServerMessage::AchievementUnlocked {
                    achievement_id: id,
                    name: definition.name.to_string(),
                    description: definition.description.to_string(),
                });
            }
        }
    }

    /// Tears the connection down: closes the open view and stops every watcher.
    pub async fn shutdown(&mut self) {
        self.close_story(CloseReason::Unmount).await;
        self.scope.close();
        self.events.shutdown();
    }
}
