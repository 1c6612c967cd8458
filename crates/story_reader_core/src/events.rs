//! crates/story_reader_core/src/events.rs
//!
//! A publish/subscribe registry for app-level events (app-state transitions,
//! network changes, locale changes). One registry is created per reader context
//! and handed to every component that needs it; nothing here is global.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Active,
    Inactive,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub connected: bool,
    pub internet_reachable: bool,
}

impl NetworkStatus {
    pub fn is_online(&self) -> bool {
        self.connected && self.internet_reachable
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    AppState { from: AppState, to: AppState },
    Network(NetworkStatus),
    LocaleChanged(String),
    /// A caller-declared dependency of the refreshed data changed.
    DependenciesChanged,
}

/// Owns the broadcast channel. Dropping it, or calling `shutdown`, ends every subscription.
pub struct EventRegistry {
    sender: Option<broadcast::Sender<AppEvent>>,
}

impl Default for EventRegistry {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender: Some(sender),
        }
    }
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` once the registry has been shut down.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<AppEvent>> {
        self.sender.as_ref().map(|sender| sender.subscribe())
    }

    /// Delivers `event` to current subscribers and returns how many received it.
    pub fn publish(&self, event: AppEvent) -> usize {
        match &self.sender {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => {
                debug!("Dropping event published after shutdown: {:?}", event);
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender
            .as_ref()
            .map_or(0, |sender| sender.receiver_count())
    }

    pub fn shutdown(&mut self) {
        self.sender = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let registry = EventRegistry::new();
        let mut rx = registry.subscribe().unwrap();

        let delivered = registry.publish(AppEvent::LocaleChanged("de".into()));
        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await.unwrap(), AppEvent::LocaleChanged("de".into()));
    }

    #[tokio::test]
    async fn shutdown_closes_subscriptions() {
        let mut registry = EventRegistry::new();
        let mut rx = registry.subscribe().unwrap();

        registry.shutdown();

        assert!(registry.subscribe().is_none());
        assert_eq!(registry.publish(AppEvent::DependenciesChanged), 0);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[test]
    fn online_needs_both_flags() {
        let half = NetworkStatus {
            connected: true,
            internet_reachable: false,
        };
        assert!(!half.is_online());
        assert!(NetworkStatus {
            connected: true,
            internet_reachable: true
        }
        .is_online());
    }
}
