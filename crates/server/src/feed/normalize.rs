// Read-side normalization of project documents. Older clients may have left
// array fields out or stored a vote counter instead of a list of user ids.

use serde_json::{json, Map, Value};

use crate::{
    db::models::Project,
    error::{AppError, Result},
    store::StoredDocument,
};

const ARRAY_FIELDS: [&str; 8] = [
    "supports",
    "opposes",
    "verifies",
    "followers",
    "comments",
    "collaborators",
    "collaborationRequests",
    "media",
];

pub const ANONYMOUS_DISPLAY_NAME: &str = "Anonymous";

pub fn normalize_document(doc: &StoredDocument) -> Result<Project> {
    let mut data = doc.data.clone();
    let object = data
        .as_object_mut()
        .ok_or_else(|| AppError::Internal(format!("Project {} is not an object", doc.id)))?;

    for field in ARRAY_FIELDS {
        // Absent, null, or the legacy numeric counters all become empty lists.
        if !matches!(object.get(field), Some(Value::Array(_))) {
            object.insert(field.to_string(), Value::Array(Vec::new()));
        }
    }

    for field in ["title", "description"] {
        if !matches!(object.get(field), Some(Value::String(_))) {
            object.insert(field.to_string(), Value::String(String::new()));
        }
    }

    if !matches!(object.get("createdAt"), Some(Value::Number(_))) {
        object.insert("createdAt".to_string(), Value::from(doc.created_at));
    }

    synthesize_creator(object);
    object.insert("id".to_string(), Value::String(doc.id.clone()));

    Ok(serde_json::from_value(data)?)
}

// Documents that cannot be read are skipped.
pub fn normalize_all(docs: &[StoredDocument]) -> Vec<Project> {
    docs.iter()
        .filter_map(|doc| match normalize_document(doc) {
            Ok(project) => Some(project),
            Err(e) => {
                tracing::warn!(project_id = %doc.id, error = %e, "Skipping unreadable project");
                None
            }
        })
        .collect()
}

fn synthesize_creator(object: &mut Map<String, Value>) {
    if matches!(object.get("creator"), Some(Value::Object(_))) {
        return;
    }
    let created_by = object
        .get("createdBy")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    object.insert(
        "creator".to_string(),
        json!({ "id": created_by, "displayName": ANONYMOUS_DISPLAY_NAME }),
    );
}
