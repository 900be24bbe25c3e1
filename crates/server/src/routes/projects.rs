use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    db::models::{LocationData, Project, ProjectState},
    error::{AppError, Result},
    feed::{
        FeedFilter, FeedScope, LocationFilter, ProjectFeedQuery, HOME_FEED_INITIAL_PAGE_SIZE,
    },
    middleware::auth::AuthUser,
    services::{
        projects::{NewProject, Vote},
        stats::{self, PartialResult},
    },
    store::Cursor,
    AppState,
};

const MAX_PAGE_SIZE: u32 = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_projects).post(create_project))
        .route("/:id", get(get_project).delete(delete_project))
        .route("/:id/state", put(set_state))
        .route("/:id/support", post(support))
        .route("/:id/oppose", post(oppose))
        .route("/:id/verify", post(verify))
        .route("/:id/follow", post(follow))
        .route("/:id/comments", post(add_comment))
        .route("/:id/collaboration-requests", post(request_collaboration))
        .route(
            "/:id/collaboration-requests/:user_id/accept",
            post(accept_request),
        )
        .route(
            "/:id/collaboration-requests/:user_id/reject",
            post(reject_request),
        )
        .route("/:id/collaborators/:user_id", delete(remove_collaborator))
        .route("/:id/collaborator-stats", post(recalculate_collaborator_stats))
}

#[derive(Debug, Deserialize)]
pub struct FeedParams {
    #[serde(default)]
    pub scope: FeedScope,
    pub limit: Option<u32>,
    pub cursor: Option<String>,
    pub search: Option<String>,
    pub state: Option<ProjectState>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    // First load of the home screen, which asks for a shorter page.
    #[serde(default)]
    pub home: bool,
}

impl FeedParams {
    fn location(&self) -> Option<LocationData> {
        let (lat, lng) = (self.lat?, self.lng?);
        let mut location = LocationData::at(lat, lng);
        location.city = self.city.clone();
        location.state = self.region.clone();
        location.country = self.country.clone();
        Some(location)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedResponse {
    pub projects: Vec<Project>,
    pub has_more: bool,
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StateRequest {
    pub state: ProjectState,
}

#[derive(Debug, Deserialize)]
pub struct CommentRequest {
    pub text: String,
}

async fn list_projects(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<FeedParams>,
) -> Result<Json<FeedResponse>> {
    let start_after = params.cursor.as_deref().map(Cursor::decode).transpose()?;
    let location = params.location();
    let limit = match (params.limit, params.home && start_after.is_none()) {
        (Some(limit), _) => Some(limit.clamp(1, MAX_PAGE_SIZE)),
        (None, true) => Some(HOME_FEED_INITIAL_PAGE_SIZE),
        (None, false) => None,
    };

    let filter = FeedFilter {
        scope: params.scope,
        user_id: Some(user.id),
        location: location.clone(),
        search: params.search,
        limit,
        state: params.state,
    };

    let query = ProjectFeedQuery::with_page_size(state.store.clone(), state.config.feed_page_size);
    let page = query.fetch(&filter, start_after).await?;
    let projects = LocationFilter::new(location).apply(filter.scope, page.records);

    Ok(Json(FeedResponse {
        projects,
        has_more: page.has_more,
        cursor: page.cursor.map(|c| c.encode()),
    }))
}

async fn create_project(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<NewProject>,
) -> Result<(StatusCode, Json<Project>)> {
    let project = state.projects.create(&user, body).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Project>> {
    Ok(Json(state.projects.get(&id, Some(&user.id)).await?))
}

async fn delete_project(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.projects.delete(&id, &user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_state(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<StateRequest>,
) -> Result<Json<Project>> {
    Ok(Json(state.projects.set_state(&id, &user.id, body.state).await?))
}

async fn support(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Project>> {
    Ok(Json(state.projects.vote(&id, &user.id, Vote::Support).await?))
}

async fn oppose(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Project>> {
    Ok(Json(state.projects.vote(&id, &user.id, Vote::Oppose).await?))
}

async fn verify(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Project>> {
    Ok(Json(state.projects.toggle_verify(&id, &user.id).await?))
}

async fn follow(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Project>> {
    Ok(Json(state.projects.toggle_follow(&id, &user.id).await?))
}

async fn add_comment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<CommentRequest>,
) -> Result<(StatusCode, Json<Project>)> {
    let project = state.projects.add_comment(&id, &user, &body.text).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn request_collaboration(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Project>> {
    Ok(Json(state.projects.request_collaboration(&id, &user).await?))
}

async fn accept_request(
    State(state): State<AppState>,
    user: AuthUser,
    Path((id, requester_id)): Path<(String, String)>,
) -> Result<Json<Project>> {
    let project = state
        .projects
        .respond_to_request(&id, &user.id, &requester_id, true)
        .await?;
    Ok(Json(project))
}

async fn reject_request(
    State(state): State<AppState>,
    user: AuthUser,
    Path((id, requester_id)): Path<(String, String)>,
) -> Result<Json<Project>> {
    let project = state
        .projects
        .respond_to_request(&id, &user.id, &requester_id, false)
        .await?;
    Ok(Json(project))
}

async fn remove_collaborator(
    State(state): State<AppState>,
    user: AuthUser,
    Path((id, collaborator_id)): Path<(String, String)>,
) -> Result<Json<Project>> {
    let project = state
        .projects
        .remove_collaborator(&id, &user.id, &collaborator_id)
        .await?;
    Ok(Json(project))
}

async fn recalculate_collaborator_stats(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<PartialResult>> {
    let project = state.projects.get(&id, Some(&user.id)).await?;
    if !project.is_participant(&user.id) {
        return Err(AppError::Forbidden(
            "Only participants can refresh collaborator stats".to_string(),
        ));
    }
    Ok(Json(stats::recalculate_participants(&state.store, &project).await))
}
