// Project mutations. Every change is a read-modify-write of the project
// document through the store, so live feed subscriptions see it.

use serde::Deserialize;
use uuid::Uuid;

use crate::{
    db::models::{
        Collaborator, CollaborationRequest, Comment, CreatorInfo, GeoPoint, MediaRef,
        MessageKind, Project, ProjectScope, ProjectState, RequestStatus, Scope,
    },
    error::{AppError, Result},
    feed::{normalize::normalize_document, query::visible_to},
    geo,
    middleware::auth::AuthUser,
    services::messages::{self, NewMessage},
    store::{now_ms, ProjectStore, StoredDocument},
};

pub const COLLABORATOR_ROLE: &str = "collaborator";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProject {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub scope: Scope,
    #[serde(default)]
    pub place: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub state: Option<ProjectState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Support,
    Oppose,
}

/// Flip the user's vote. Supporting removes any opposition and vice versa,
/// so the user is never in both lists.
pub fn toggle_vote(project: &mut Project, user_id: &str, vote: Vote) {
    let Project {
        supports, opposes, ..
    } = project;
    let (target, other) = match vote {
        Vote::Support => (supports, opposes),
        Vote::Oppose => (opposes, supports),
    };

    if target.iter().any(|id| id == user_id) {
        target.retain(|id| id != user_id);
    } else {
        target.push(user_id.to_string());
        other.retain(|id| id != user_id);
    }
}

#[derive(Debug, Clone, Copy)]
enum Membership {
    Verify,
    Follow,
}

#[derive(Clone)]
pub struct ProjectService {
    store: ProjectStore,
}

impl ProjectService {
    pub fn new(store: ProjectStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ProjectStore {
        &self.store
    }

    pub async fn create(&self, user: &AuthUser, input: NewProject) -> Result<Project> {
        if input.title.trim().is_empty() {
            return Err(AppError::Validation("Project title is required".to_string()));
        }

        let location = match (input.lat, input.lng) {
            (Some(lat), Some(lng)) => {
                if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
                    return Err(AppError::Validation("Coordinates out of range".to_string()));
                }
                Some(GeoPoint {
                    lat,
                    lng,
                    geohash: geo::encode_geohash(lat, lng, geo::DEFAULT_GEOHASH_PRECISION),
                })
            }
            (None, None) => None,
            _ => {
                return Err(AppError::Validation(
                    "Both lat and lng are required".to_string(),
                ))
            }
        };

        let now = now_ms();
        let mut project = Project {
            id: None,
            title: input.title.trim().to_string(),
            description: input.description,
            scope: ProjectScope {
                kind: input.scope,
                place: input.place.filter(|p| !p.trim().is_empty()),
                location,
            },
            state: input.state.unwrap_or_default(),
            created_by: user.id.clone(),
            creator: CreatorInfo {
                id: user.id.clone(),
                display_name: user.name.clone(),
                photo_url: None,
            },
            supports: Vec::new(),
            opposes: Vec::new(),
            verifies: Vec::new(),
            followers: Vec::new(),
            comments: Vec::new(),
            collaborators: Vec::new(),
            collaboration_requests: Vec::new(),
            media: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        let id = self.store.add(&project).await?;
        tracing::info!(project_id = %id, scope = %project.scope.kind, "Project created");
        project.id = Some(id);
        Ok(project)
    }

    // Grupal projects are reported as missing to non-participants.
    pub async fn get(&self, id: &str, viewer: Option<&str>) -> Result<Project> {
        let doc = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound("Project not found".to_string()))?;
        let project = normalize_document(&doc)?;
        if !visible_to(&project, viewer) {
            return Err(AppError::NotFound("Project not found".to_string()));
        }
        Ok(project)
    }

    pub async fn delete(&self, id: &str, user_id: &str) -> Result<()> {
        let project = self.get(id, Some(user_id)).await?;
        if project.created_by != user_id {
            return Err(AppError::Forbidden(
                "Only the creator can delete this project".to_string(),
            ));
        }
        self.store.delete(id).await?;
        tracing::info!(project_id = %id, "Project deleted");
        Ok(())
    }

    pub async fn set_state(&self, id: &str, user_id: &str, state: ProjectState) -> Result<Project> {
        self.update(id, Some(user_id), |project| {
            if !project.is_participant(user_id) {
                return Err(AppError::Forbidden(
                    "Only participants can change the project state".to_string(),
                ));
            }
            project.state = state;
            Ok(())
        })
        .await
    }

    pub async fn vote(&self, id: &str, user_id: &str, vote: Vote) -> Result<Project> {
        self.update(id, Some(user_id), |project| {
            toggle_vote(project, user_id, vote);
            Ok(())
        })
        .await
    }

    pub async fn toggle_verify(&self, id: &str, user_id: &str) -> Result<Project> {
        self.toggle_membership(id, user_id, Membership::Verify).await
    }

    pub async fn toggle_follow(&self, id: &str, user_id: &str) -> Result<Project> {
        self.toggle_membership(id, user_id, Membership::Follow).await
    }

    pub async fn add_comment(&self, id: &str, user: &AuthUser, text: &str) -> Result<Project> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::Validation("Comment text is required".to_string()));
        }

        let comment = Comment {
            id: Uuid::new_v4().to_string(),
            user_id: user.id.clone(),
            display_name: user.name.clone(),
            text: text.to_string(),
            created_at: now_ms(),
        };
        self.update(id, Some(&user.id), |project| {
            project.comments.push(comment);
            Ok(())
        })
        .await
    }

    pub async fn attach_media(&self, id: &str, user_id: &str, media: MediaRef) -> Result<Project> {
        self.update(id, Some(user_id), |project| {
            if !project.is_participant(user_id) {
                return Err(AppError::Forbidden(
                    "Only participants can add media".to_string(),
                ));
            }
            project.media.push(media);
            Ok(())
        })
        .await
    }

    pub async fn detach_media(&self, id: &str, user_id: &str, path: &str) -> Result<Project> {
        self.update(id, Some(user_id), |project| {
            if !project.is_participant(user_id) {
                return Err(AppError::Forbidden(
                    "Only participants can remove media".to_string(),
                ));
            }
            project.media.retain(|m| m.path != path);
            Ok(())
        })
        .await
    }

    pub async fn request_collaboration(&self, id: &str, user: &AuthUser) -> Result<Project> {
        let project = self
            .update(id, Some(&user.id), |project| {
                if project.is_participant(&user.id) {
                    return Err(AppError::Validation(
                        "Already part of this project".to_string(),
                    ));
                }
                if project
                    .collaboration_requests
                    .iter()
                    .any(|r| r.user_id == user.id && r.status == RequestStatus::Pending)
                {
                    return Err(AppError::Validation(
                        "Collaboration already requested".to_string(),
                    ));
                }
                project.collaboration_requests.push(CollaborationRequest {
                    user_id: user.id.clone(),
                    display_name: user.name.clone(),
                    status: RequestStatus::Pending,
                    requested_at: now_ms(),
                });
                Ok(())
            })
            .await?;

        messages::send(
            &self.store.database().pool,
            NewMessage {
                recipient_id: &project.created_by,
                sender_id: &user.id,
                project_id: id,
                kind: MessageKind::CollaborationRequest,
                body: format!("{} wants to collaborate on \"{}\"", user.name, project.title),
            },
        )
        .await?;
        Ok(project)
    }

    /// Accept or reject a pending request. Either way the request leaves the
    /// pending list and the requester is notified.
    pub async fn respond_to_request(
        &self,
        id: &str,
        creator_id: &str,
        requester_id: &str,
        accept: bool,
    ) -> Result<Project> {
        let project = self
            .update(id, Some(creator_id), |project| {
                if project.created_by != creator_id {
                    return Err(AppError::Forbidden(
                        "Only the creator can answer collaboration requests".to_string(),
                    ));
                }
                let index = project
                    .collaboration_requests
                    .iter()
                    .position(|r| r.user_id == requester_id && r.status == RequestStatus::Pending)
                    .ok_or_else(|| {
                        AppError::NotFound("Collaboration request not found".to_string())
                    })?;
                let request = project.collaboration_requests.remove(index);

                if accept && !project.is_collaborator(requester_id) {
                    project.collaborators.push(Collaborator {
                        user_id: request.user_id,
                        display_name: request.display_name,
                        role: COLLABORATOR_ROLE.to_string(),
                    });
                }
                Ok(())
            })
            .await?;

        let (kind, verb) = if accept {
            (MessageKind::CollaborationAccepted, "accepted")
        } else {
            (MessageKind::CollaborationRejected, "rejected")
        };
        messages::send(
            &self.store.database().pool,
            NewMessage {
                recipient_id: requester_id,
                sender_id: creator_id,
                project_id: id,
                kind,
                body: format!("Your request to collaborate on \"{}\" was {verb}", project.title),
            },
        )
        .await?;
        Ok(project)
    }

    /// The creator can remove anyone; a collaborator can remove themselves.
    pub async fn remove_collaborator(&self, id: &str, actor_id: &str, target_id: &str) -> Result<Project> {
        self.update(id, Some(actor_id), |project| {
            if project.created_by != actor_id && actor_id != target_id {
                return Err(AppError::Forbidden(
                    "Cannot remove this collaborator".to_string(),
                ));
            }
            let before = project.collaborators.len();
            project.collaborators.retain(|c| c.user_id != target_id);
            if project.collaborators.len() == before {
                return Err(AppError::NotFound("Collaborator not found".to_string()));
            }
            Ok(())
        })
        .await
    }

    // Check and flip in the same transaction, so concurrent toggles by one
    // user cannot both take the same branch.
    async fn toggle_membership(&self, id: &str, user_id: &str, list: Membership) -> Result<Project> {
        self.update(id, Some(user_id), |project| {
            let members = match list {
                Membership::Verify => &mut project.verifies,
                Membership::Follow => &mut project.followers,
            };
            if members.iter().any(|m| m == user_id) {
                members.retain(|m| m != user_id);
            } else {
                members.push(user_id.to_string());
            }
            Ok(())
        })
        .await
    }

    /// Typed read-modify-write. The document is normalized before `mutate`
    /// sees it, so legacy shapes are rewritten on the first update.
    async fn update<F>(&self, id: &str, viewer: Option<&str>, mutate: F) -> Result<Project>
    where
        F: FnOnce(&mut Project) -> Result<()>,
    {
        let doc_id = id.to_string();
        let doc = self
            .store
            .update(id, move |data| {
                let mut project = normalize_document(&StoredDocument {
                    id: doc_id,
                    created_at: 0,
                    data: data.clone(),
                })?;
                if !visible_to(&project, viewer) {
                    return Err(AppError::NotFound("Project not found".to_string()));
                }
                mutate(&mut project)?;
                project.id = None;
                *data = serde_json::to_value(&project)?;
                Ok(())
            })
            .await?;
        normalize_document(&doc)
    }
}
