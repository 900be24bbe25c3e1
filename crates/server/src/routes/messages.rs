use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;

use crate::{
    db::models::Message,
    error::Result,
    middleware::auth::AuthUser,
    services::messages,
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_messages))
        .route("/:id/read", post(mark_read))
        .route("/:id", delete(delete_message))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageListResponse {
    pub messages: Vec<Message>,
    pub unread: i64,
}

async fn list_messages(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<MessageListResponse>> {
    let inbox = messages::list_for(&state.db.pool, &user.id).await?;
    let unread = messages::unread_count(&state.db.pool, &user.id).await?;
    Ok(Json(MessageListResponse {
        messages: inbox,
        unread,
    }))
}

async fn mark_read(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    messages::mark_read(&state.db.pool, &id, &user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_message(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    messages::soft_delete(&state.db.pool, &id, &user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}
