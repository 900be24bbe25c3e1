use axum::{extract::State, routing::{get, post, put}, Json, Router};

use crate::{
    db::models::{LocationData, UserProfile, UserStats},
    error::Result,
    middleware::auth::AuthUser,
    services::{stats, users},
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/me", get(me))
        .route("/me/location", put(update_location))
        .route("/me/stats", post(recalculate_stats))
}

async fn me(State(state): State<AppState>, user: AuthUser) -> Result<Json<UserProfile>> {
    Ok(Json(users::get_profile(&state.db.pool, &user.id).await?))
}

async fn update_location(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<LocationData>,
) -> Result<Json<UserProfile>> {
    let profile = users::update_location(&state.db.pool, &state.geocoding, &user.id, body).await?;
    Ok(Json(profile))
}

async fn recalculate_stats(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<UserStats>> {
    Ok(Json(stats::recalculate(&state.store, &user.id).await?))
}
