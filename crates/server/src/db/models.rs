use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Grupal,
    Local,
    State,
    National,
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Grupal => "grupal",
            Scope::Local => "local",
            Scope::State => "state",
            Scope::National => "national",
            Scope::Global => "global",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grupal" => Ok(Scope::Grupal),
            "local" => Ok(Scope::Local),
            "state" => Ok(Scope::State),
            "national" => Ok(Scope::National),
            "global" => Ok(Scope::Global),
            other => Err(AppError::Validation(format!("Unknown scope '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProjectState {
    #[default]
    Building,
    Implementing,
    Done,
}

impl ProjectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectState::Building => "building",
            ProjectState::Implementing => "implementing",
            ProjectState::Done => "done",
        }
    }
}

impl FromStr for ProjectState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "building" => Ok(ProjectState::Building),
            "implementing" => Ok(ProjectState::Implementing),
            "done" => Ok(ProjectState::Done),
            other => Err(AppError::Validation(format!("Unknown state '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
    pub geohash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectScope {
    #[serde(rename = "type")]
    pub kind: Scope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatorInfo {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub user_id: String,
    pub display_name: String,
    pub text: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    pub user_id: String,
    pub display_name: String,
    pub role: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationRequest {
    pub user_id: String,
    pub display_name: String,
    pub status: RequestStatus,
    pub requested_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub url: String,
    pub path: String,
    pub content_type: String,
}

/// A project document. `id` is assigned by the store and absent before
/// the first write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    pub description: String,
    pub scope: ProjectScope,
    #[serde(default)]
    pub state: ProjectState,
    pub created_by: String,
    pub creator: CreatorInfo,
    pub supports: Vec<String>,
    pub opposes: Vec<String>,
    pub verifies: Vec<String>,
    pub followers: Vec<String>,
    pub comments: Vec<Comment>,
    pub collaborators: Vec<Collaborator>,
    pub collaboration_requests: Vec<CollaborationRequest>,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Project {
    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    pub fn is_collaborator(&self, user_id: &str) -> bool {
        self.collaborators.iter().any(|c| c.user_id == user_id)
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.created_by == user_id || self.is_collaborator(user_id)
    }
}

/// Device or manually entered location, optionally reverse geocoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationData {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geohash: Option<String>,
}

impl LocationData {
    pub fn at(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            accuracy: None,
            timestamp: 0,
            city: None,
            state: None,
            country: None,
            country_code: None,
            formatted_address: None,
            geohash: None,
        }
    }
}

/// Derived project counts. Recomputed on demand, so it may drift from the
/// projects it summarizes between recalculations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub created_building: u32,
    pub created_implementing: u32,
    pub created_done: u32,
    pub collaborated_building: u32,
    pub collaborated_implementing: u32,
    pub collaborated_done: u32,
    pub supports_given: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub photo_url: Option<String>,
    pub location: Option<LocationData>,
    pub stats: UserStats,
    pub created_at: String,
    pub last_login_at: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: String,
    pub email: String,
    pub name: String,
    pub photo_url: Option<String>,
    pub location: Option<String>,
    pub stats: Option<String>,
    pub created_at: String,
    pub last_login_at: Option<String>,
}

impl UserRow {
    /// Unreadable JSON columns degrade to empty values.
    pub fn into_profile(self) -> UserProfile {
        let location = self
            .location
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());
        let stats = self
            .stats
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();

        UserProfile {
            id: self.id,
            email: self.email,
            display_name: self.name,
            photo_url: self.photo_url,
            location,
            stats,
            created_at: self.created_at,
            last_login_at: self.last_login_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    CollaborationRequest,
    CollaborationAccepted,
    CollaborationRejected,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::CollaborationRequest => "collaboration_request",
            MessageKind::CollaborationAccepted => "collaboration_accepted",
            MessageKind::CollaborationRejected => "collaboration_rejected",
        }
    }
}

impl FromStr for MessageKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collaboration_request" => Ok(MessageKind::CollaborationRequest),
            "collaboration_accepted" => Ok(MessageKind::CollaborationAccepted),
            "collaboration_rejected" => Ok(MessageKind::CollaborationRejected),
            other => Err(AppError::Internal(format!("Unknown message kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub recipient_id: String,
    pub sender_id: String,
    pub project_id: String,
    pub kind: MessageKind,
    pub body: String,
    pub read: bool,
    pub deleted: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub recipient_id: String,
    pub sender_id: String,
    pub project_id: String,
    pub kind: String,
    pub body: String,
    pub read: bool,
    pub deleted: bool,
    pub created_at: String,
}

impl TryFrom<MessageRow> for Message {
    type Error = AppError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            kind: row.kind.parse()?,
            id: row.id,
            recipient_id: row.recipient_id,
            sender_id: row.sender_id,
            project_id: row.project_id,
            body: row.body,
            read: row.read,
            deleted: row.deleted,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_round_trips_through_str() {
        for scope in [
            Scope::Grupal,
            Scope::Local,
            Scope::State,
            Scope::National,
            Scope::Global,
        ] {
            assert_eq!(scope.as_str().parse::<Scope>().unwrap(), scope);
        }
        assert!("planet".parse::<Scope>().is_err());
    }

    #[test]
    fn test_project_scope_uses_type_key() {
        let scope: ProjectScope =
            serde_json::from_value(serde_json::json!({ "type": "local", "place": "Córdoba" }))
                .unwrap();
        assert_eq!(scope.kind, Scope::Local);
        assert_eq!(scope.place.as_deref(), Some("Córdoba"));
        assert!(scope.location.is_none());
    }

    #[test]
    fn test_user_row_with_bad_json_degrades() {
        let row = UserRow {
            id: "u1".into(),
            email: "u1@example.com".into(),
            name: "User One".into(),
            photo_url: None,
            location: Some("{not json".into()),
            stats: None,
            created_at: "2024-01-01T00:00:00Z".into(),
            last_login_at: None,
        };
        let profile = row.into_profile();
        assert!(profile.location.is_none());
        assert_eq!(profile.stats, UserStats::default());
    }
}
