use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    routing::{delete, post},
    Json, Router,
};
use serde::Deserialize;

use crate::{
    db::models::{MediaRef, Project, UserProfile},
    error::{AppError, Result},
    middleware::auth::AuthUser,
    services::{
        storage::{MediaKind, MAX_PROJECT_MEDIA_BYTES},
        users,
    },
    AppState,
};

// Room for multipart boundaries and headers around the largest file.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/projects/:project_id", post(upload_project_media))
        .route("/profile", post(upload_profile_photo))
        .route("/", delete(delete_media))
        .layer(DefaultBodyLimit::max(MAX_PROJECT_MEDIA_BYTES + MULTIPART_OVERHEAD))
}

#[derive(Debug, Deserialize)]
pub struct DeleteMediaQuery {
    pub path: String,
}

struct UploadedFile {
    content_type: String,
    data: Vec<u8>,
}

/// Reads the first field named `file`. Size is checked by the storage
/// service, which reports the precise limit.
async fn read_file_field(multipart: &mut Multipart) -> Result<UploadedFile> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Failed to read multipart field: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let content_type = field
            .content_type()
            .map(str::to_string)
            .ok_or_else(|| AppError::UnsupportedMediaType("missing content type".to_string()))?;
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::Validation(format!("Failed to read file: {e}")))?;

        return Ok(UploadedFile {
            content_type,
            data: data.to_vec(),
        });
    }
    Err(AppError::Validation("Missing 'file' field".to_string()))
}

async fn upload_project_media(
    State(state): State<AppState>,
    user: AuthUser,
    Path(project_id): Path<String>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Project>)> {
    let project = state.projects.get(&project_id, Some(&user.id)).await?;
    if !project.is_participant(&user.id) {
        return Err(AppError::Forbidden(
            "Only participants can add media".to_string(),
        ));
    }

    let file = read_file_field(&mut multipart).await?;
    let stored = state
        .storage
        .upload(
            MediaKind::ProjectMedia,
            &format!("projects/{project_id}"),
            &file.content_type,
            &file.data,
        )
        .await?;

    let media = MediaRef {
        url: stored.url,
        path: stored.path,
        content_type: file.content_type,
    };
    let project = state
        .projects
        .attach_media(&project_id, &user.id, media)
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn upload_profile_photo(
    State(state): State<AppState>,
    user: AuthUser,
    mut multipart: Multipart,
) -> Result<Json<UserProfile>> {
    let file = read_file_field(&mut multipart).await?;
    let stored = state
        .storage
        .upload(
            MediaKind::ProfilePhoto,
            &format!("profiles/{}", user.id),
            &file.content_type,
            &file.data,
        )
        .await?;

    Ok(Json(
        users::update_photo(&state.db.pool, &user.id, &stored.url).await?,
    ))
}

/// Users may delete their own profile photos and media of projects they
/// take part in.
async fn delete_media(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<DeleteMediaQuery>,
) -> Result<StatusCode> {
    let mut segments = query.path.split('/');
    match (segments.next(), segments.next()) {
        (Some("profiles"), Some(owner)) if owner == user.id => {
            state.storage.delete(&query.path).await?;
        }
        (Some("projects"), Some(project_id)) => {
            state
                .projects
                .detach_media(project_id, &user.id, &query.path)
                .await?;
            state.storage.delete(&query.path).await?;
        }
        _ => {
            return Err(AppError::Forbidden(
                "Cannot delete this file".to_string(),
            ))
        }
    }
    Ok(StatusCode::NO_CONTENT)
}
