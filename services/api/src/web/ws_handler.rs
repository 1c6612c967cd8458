//! services/api/src/web/ws_handler.rs
//!
//! This is the main entry point and control loop for a WebSocket connection.
//! Client messages are applied to the connection's `ReaderContext` one at a time;
//! everything the engine wants to tell the client flows through a single outbound
//! channel drained by a writer task.

use crate::web::{
    protocol::{ClientMessage, ServerMessage},
    state::{AppState, Identity, ReaderContext},
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    Extension,
};
use futures::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use std::sync::Arc;
use std::time::Duration;
use story_reader_core::session::CloseReason;
use story_reader_core::tracker::ScrollGeometry;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// The handler for upgrading HTTP requests to WebSocket connections.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, identity))
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, identity: Identity) {
    info!("New WebSocket connection established for {:?}", identity.caller);

    let (sender, mut receiver) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let writer = tokio::spawn(write_messages(sender, outbound_rx));

    let mut context = ReaderContext::new(app_state, identity, outbound_tx);
    let mut background_closures = context.start().await;

    // --- Main Message Loop ---
    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_text_message(text.as_str(), &mut context).await;
                }
                Some(Ok(Message::Close(_))) => {
                    info!("Client sent close message.");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket receive failed: {}", e);
                    break;
                }
                None => {
                    info!("Client disconnected.");
                    break;
                }
            },
            Some(closed) = recv_closure(&mut background_closures) => {
                context.session_closed(closed).await;
            }
        }
    }

    // --- Cleanup ---
    context.shutdown().await;
    drop(context);
    match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await {
        Ok(Err(e)) => error!("Writer task failed: {}", e),
        Ok(Ok(())) => {}
        Err(_) => warn!("Timed out flushing messages to a closing connection."),
    }
    info!("WebSocket connection closed.");
}

/// Waits on the background-closure channel, or forever for guests who have none.
async fn recv_closure<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Drains the outbound channel into the socket until every sender is gone.
async fn write_messages(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<ServerMessage>,
) {
    while let Some(message) = outbound.recv().await {
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize {:?}: {}", message, e);
                continue;
            }
        };
        if sender.send(Message::Text(json.into())).await.is_err() {
            debug!("Client went away; dropping remaining messages.");
            break;
        }
    }
    let _ = sender.close().await;
}

/// Helper function to handle the logic for different `ClientMessage` variants.
async fn handle_text_message(text: &str, context: &mut ReaderContext) {
    let client_msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Failed to deserialize client message: {}", e);
            context.send(ServerMessage::Error {
                message: "Unrecognized message.".to_string(),
            });
            return;
        }
    };

    match client_msg {
        ClientMessage::OpenStory {
            story_id,
            personalized,
        } => {
            context.open_story(story_id, personalized).await;
        }
        ClientMessage::Layout {
            content_height,
            viewport_height,
        } => {
            context.layout(content_height, viewport_height);
        }
        ClientMessage::Scroll {
            offset,
            viewport_height,
            content_height,
        } => {
            context
                .scroll(ScrollGeometry {
                    offset,
                    viewport_height,
                    content_height,
                })
                .await;
        }
        ClientMessage::AppState { state } => {
            context.app_state(state).await;
        }
        ClientMessage::Network {
            connected,
            internet_reachable,
        } => {
            context.network(connected, internet_reachable);
        }
        ClientMessage::LocaleChanged { locale } => {
            context.locale_changed(locale);
        }
        ClientMessage::DependenciesChanged => {
            context.dependencies_changed();
        }
        ClientMessage::CloseStory => {
            context.close_story(CloseReason::Unmount).await;
        }
    }
}
