// Live project feed over WebSocket. Each connection owns one feed facade;
// the client steers it with JSON commands and receives a snapshot after
// every change.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_stream::wrappers::WatchStream;

use crate::{
    db::models::LocationData,
    error::{AppError, Result},
    feed::{FeedScope, FeedSnapshot, ProjectFeedFacade},
    middleware::auth::{decode_token, AuthUser},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedCommand {
    Scope { scope: FeedScope },
    LoadMore,
    Refresh,
    Location(LocationData),
    ClearLocation,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Snapshot(FeedSnapshot),
    Error { error: String },
}

type Sender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Result<Response> {
    let token = query.token.ok_or(AppError::Unauthorized)?;
    let user = decode_token(&token, &state.config.jwt_secret)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, user, state)))
}

async fn send(sender: &Sender, message: &ServerMessage) -> bool {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode feed message");
            return true;
        }
    };
    sender.lock().await.send(Message::Text(text)).await.is_ok()
}

async fn apply(facade: &ProjectFeedFacade, command: FeedCommand) -> Result<()> {
    match command {
        FeedCommand::Scope { scope } => {
            facade.activate_scope(scope).await?;
        }
        FeedCommand::LoadMore => {
            facade.load_more().await?;
        }
        FeedCommand::Refresh => facade.refresh().await?,
        FeedCommand::Location(location) => facade.set_location(Some(location)).await?,
        FeedCommand::ClearLocation => facade.set_location(None).await?,
    }
    Ok(())
}

async fn handle_socket(socket: WebSocket, user: AuthUser, state: AppState) {
    let (sender, mut receiver) = socket.split();
    let sender: Sender = Arc::new(Mutex::new(sender));

    let facade = ProjectFeedFacade::with_settings(
        state.store.clone(),
        Some(user.id.clone()),
        state.config.feed_page_size,
        state.config.feed_stale_after,
    );
    tracing::debug!(user_id = %user.id, "Feed socket connected");

    // Forward every published snapshot to this client
    let mut snapshots = WatchStream::new(facade.subscribe());
    let push_sender = sender.clone();
    let push_task = tokio::spawn(async move {
        while let Some(snapshot) = snapshots.next().await {
            if !send(&push_sender, &ServerMessage::Snapshot(snapshot)).await {
                break;
            }
        }
    });

    if let Err(e) = facade.activate_scope(FeedScope::default()).await {
        tracing::warn!(user_id = %user.id, error = %e, "Initial feed query failed");
        send(&sender, &ServerMessage::Error { error: e.to_string() }).await;
    }

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                let outcome = match serde_json::from_str::<FeedCommand>(&text) {
                    Ok(command) => apply(&facade, command).await,
                    Err(e) => Err(AppError::Validation(format!("Invalid command: {e}"))),
                };
                if let Err(e) = outcome {
                    tracing::debug!(user_id = %user.id, error = %e, "Feed command failed");
                    let message = ServerMessage::Error {
                        error: e.to_string(),
                    };
                    if !send(&sender, &message).await {
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            Message::Ping(data) => {
                let _ = sender.lock().await.send(Message::Pong(data)).await;
            }
            _ => {}
        }
    }

    facade.deactivate();
    push_task.abort();
    tracing::debug!(user_id = %user.id, "Feed socket closed");
}
