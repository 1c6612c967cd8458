//! services/api/src/web/protocol.rs
//!
//! Defines the WebSocket message protocol between a reading client and the API server.

use serde::{Deserialize, Serialize};
use story_reader_core::domain::{ReadingLimitDecision, UsageLimits};
use story_reader_core::events::AppState as AppLifecycle;
use uuid::Uuid;

//=========================================================================================
// Messages Sent FROM the Client TO the Server
//=========================================================================================

/// Represents the structured text messages a client can send to the server.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Mounts a story view. Any story already open on this connection is closed first.
    OpenStory {
        story_id: Uuid,
        #[serde(default)]
        personalized: bool,
    },

    /// Content or viewport size changed without a scroll.
    Layout {
        content_height: f64,
        viewport_height: f64,
    },

    Scroll {
        offset: f64,
        viewport_height: f64,
        content_height: f64,
    },

    /// The app moved between foreground and background.
    AppState { state: AppLifecycle },

    Network {
        connected: bool,
        internet_reachable: bool,
    },

    /// The device locale changed; reset times may move with it.
    LocaleChanged { locale: String },

    /// Something the limits depend on changed, e.g. after a purchase.
    DependenciesChanged,

    /// The story view unmounted.
    CloseStory,
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client
//=========================================================================================

/// Represents the structured text messages the server can send to the client.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirms a story view is open, with the ceiling that applies to it.
    StoryOpened {
        story_id: Uuid,
        decision: ReadingLimitDecision,
        saved_progress: Option<f64>,
        /// `None` for guests and when the session record could not be written.
        session_id: Option<Uuid>,
    },

    Progress { progress: f64 },

    /// The reader hit the ceiling; the client should show the upgrade prompt.
    Paywall { message: String },

    /// Asks the client to move the view to an absolute offset.
    ScrollTo { offset: f64 },

    SessionClosed {
        session_id: Uuid,
        duration_seconds: i64,
        completed: bool,
    },

    /// Fresh limits after a refresh. `None` for guests.
    LimitsRefreshed { limits: Option<UsageLimits> },

    AchievementUnlocked {
        achievement_id: String,
        name: String,
        description: String,
    },

    /// Reports an error to the client, which should display an error message.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_use_snake_case_tags() {
        let open: ClientMessage = serde_json::from_str(
            r#"{"type":"open_story","story_id":"9b2f3c1e-8d4a-4f6b-9a7e-2c5d1e0f3a4b"}"#,
        )
        .unwrap();
        assert!(matches!(open, ClientMessage::OpenStory { personalized: false, .. }));

        let state: ClientMessage =
            serde_json::from_str(r#"{"type":"app_state","state":"background"}"#).unwrap();
        assert!(matches!(
            state,
            ClientMessage::AppState {
                state: AppLifecycle::Background
            }
        ));

        let locale: ClientMessage =
            serde_json::from_str(r#"{"type":"locale_changed","locale":"de-DE"}"#).unwrap();
        assert!(matches!(locale, ClientMessage::LocaleChanged { locale } if locale == "de-DE"));

        let changed: ClientMessage =
            serde_json::from_str(r#"{"type":"dependencies_changed"}"#).unwrap();
        assert!(matches!(changed, ClientMessage::DependenciesChanged));
    }

    #[test]
    fn server_messages_are_tagged() {
        let json = serde_json::to_value(ServerMessage::Paywall {
            message: "Sign up to keep reading this story.".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "paywall");
        assert_eq!(json["message"], "Sign up to keep reading this story.");
    }
}
