// Project document store. Projects are JSON documents with a few indexed
// columns; fields may be missing or carry legacy shapes, and readers
// normalize on the way out. Every write is announced on a broadcast channel
// that drives `ProjectStore::listen`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite};
use tokio::sync::{
    broadcast::{self, error::RecvError, error::TryRecvError},
    mpsc,
};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    db::{
        models::{Project, ProjectState, Scope},
        Database,
    },
    error::{AppError, Result},
};

const CHANGE_CHANNEL_CAPACITY: usize = 256;
const LISTENER_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone)]
pub struct ProjectChange {
    pub project_id: String,
    pub kind: ChangeKind,
}

// Single-field filter. There is no OR across fields; callers run two
// queries and merge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Predicate {
    All,
    Scope(Scope),
    Creator(String),
    ScopeAndCreator(Scope, String),
    ScopeAndCollaborator(Scope, String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub created_at: i64,
    pub id: String,
}

impl Cursor {
    pub fn encode(&self) -> String {
        format!("{}_{}", self.created_at, self.id)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let invalid = || AppError::Validation("Invalid cursor".to_string());
        let (created_at, id) = raw.split_once('_').ok_or_else(invalid)?;
        if id.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            created_at: created_at.parse().map_err(|_| invalid())?,
            id: id.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProjectQuery {
    pub predicate: Predicate,
    pub state: Option<ProjectState>,
    pub limit: Option<u32>,
    pub start_after: Option<Cursor>,
}

impl ProjectQuery {
    pub fn new(predicate: Predicate) -> Self {
        Self {
            predicate,
            state: None,
            limit: None,
            start_after: None,
        }
    }

    pub fn with_state(mut self, state: Option<ProjectState>) -> Self {
        self.state = state;
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_after(mut self, cursor: Option<Cursor>) -> Self {
        self.start_after = cursor;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub created_at: i64,
    pub data: Value,
}

impl StoredDocument {
    pub fn cursor(&self) -> Cursor {
        Cursor {
            created_at: self.created_at,
            id: self.id.clone(),
        }
    }
}

struct IndexFields {
    scope: String,
    creator_id: String,
    state: String,
    created_at: i64,
    collaborators: Vec<String>,
}

impl IndexFields {
    fn extract(doc: &Value) -> Result<Self> {
        let scope = doc
            .pointer("/scope/type")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Project is missing scope.type".to_string()))?;
        let creator_id = doc
            .get("createdBy")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Project is missing createdBy".to_string()))?;
        let collaborators = doc
            .get("collaborators")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|c| c.get("userId").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            scope: scope.to_string(),
            creator_id: creator_id.to_string(),
            state: doc
                .get("state")
                .and_then(Value::as_str)
                .unwrap_or(ProjectState::Building.as_str())
                .to_string(),
            created_at: doc
                .get("createdAt")
                .and_then(Value::as_i64)
                .unwrap_or_else(now_ms),
            collaborators,
        })
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Clone)]
pub struct ProjectStore {
    db: Database,
    changes: broadcast::Sender<ProjectChange>,
}

impl ProjectStore {
    pub fn new(db: Database) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { db, changes }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn changes(&self) -> broadcast::Receiver<ProjectChange> {
        self.changes.subscribe()
    }

    fn publish(&self, project_id: &str, kind: ChangeKind) {
        // No receivers is not an error.
        let _ = self.changes.send(ProjectChange {
            project_id: project_id.to_string(),
            kind,
        });
    }

    pub async fn add(&self, project: &Project) -> Result<String> {
        self.insert_document(serde_json::to_value(project)?).await
    }

    // The id is assigned here; any `id` key in the document is dropped.
    pub async fn insert_document(&self, mut doc: Value) -> Result<String> {
        if let Some(object) = doc.as_object_mut() {
            object.remove("id");
        } else {
            return Err(AppError::Validation(
                "Project document must be an object".to_string(),
            ));
        }

        let fields = IndexFields::extract(&doc)?;
        if let Some(object) = doc.as_object_mut() {
            object
                .entry("createdAt")
                .or_insert_with(|| Value::from(fields.created_at));
        }
        let id = Uuid::new_v4().to_string();

        let mut tx = self.db.pool.begin().await?;
        sqlx::query(
            "INSERT INTO projects (id, scope, creator_id, state, created_at, updated_at, doc) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&fields.scope)
        .bind(&fields.creator_id)
        .bind(&fields.state)
        .bind(fields.created_at)
        .bind(fields.created_at)
        .bind(doc.to_string())
        .execute(&mut *tx)
        .await?;

        for user_id in &fields.collaborators {
            sqlx::query(
                "INSERT OR IGNORE INTO project_collaborators (project_id, user_id) VALUES (?, ?)",
            )
            .bind(&id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::debug!(project_id = %id, scope = %fields.scope, "Project added");
        self.publish(&id, ChangeKind::Added);
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Option<StoredDocument>> {
        let row = sqlx::query_as::<_, (String, i64, String)>(
            "SELECT id, created_at, doc FROM projects WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.db.pool)
        .await?;

        row.map(into_document).transpose()
    }

    /// Read-modify-write of one document inside a transaction. Indexed
    /// columns and the collaborator index are rebuilt from the new document.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<StoredDocument>
    where
        F: FnOnce(&mut Value) -> Result<()>,
    {
        let mut tx = self.db.pool.begin().await?;

        let (id, _, raw) = sqlx::query_as::<_, (String, i64, String)>(
            "SELECT id, created_at, doc FROM projects WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound("Project not found".to_string()))?;

        let mut doc: Value = serde_json::from_str(&raw)?;
        mutate(&mut doc)?;
        if let Some(object) = doc.as_object_mut() {
            object.remove("id");
            object.insert("updatedAt".to_string(), Value::from(now_ms()));
        }

        let fields = IndexFields::extract(&doc)?;
        sqlx::query(
            "UPDATE projects SET scope = ?, creator_id = ?, state = ?, updated_at = ?, doc = ? WHERE id = ?",
        )
        .bind(&fields.scope)
        .bind(&fields.creator_id)
        .bind(&fields.state)
        .bind(now_ms())
        .bind(doc.to_string())
        .bind(&id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM project_collaborators WHERE project_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        for user_id in &fields.collaborators {
            sqlx::query(
                "INSERT OR IGNORE INTO project_collaborators (project_id, user_id) VALUES (?, ?)",
            )
            .bind(&id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.publish(&id, ChangeKind::Modified);

        let created_at = doc
            .get("createdAt")
            .and_then(Value::as_i64)
            .unwrap_or(fields.created_at);
        Ok(StoredDocument {
            id,
            created_at,
            data: doc,
        })
    }

    /// Add `value` to the array at `field` unless already present. A
    /// missing or non-array field is replaced by a fresh array.
    pub async fn array_union(&self, id: &str, field: &str, value: Value) -> Result<StoredDocument> {
        self.update(id, |doc| {
            let array = array_field(doc, field)?;
            if !array.contains(&value) {
                array.push(value);
            }
            Ok(())
        })
        .await
    }

    pub async fn array_remove(&self, id: &str, field: &str, value: Value) -> Result<StoredDocument> {
        self.update(id, |doc| {
            array_field(doc, field)?.retain(|item| item != &value);
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let mut tx = self.db.pool.begin().await?;
        sqlx::query("DELETE FROM project_collaborators WHERE project_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            tracing::debug!(project_id = %id, "Project deleted");
            self.publish(id, ChangeKind::Removed);
        }
        Ok(deleted)
    }

    pub async fn query(&self, query: &ProjectQuery) -> Result<Vec<StoredDocument>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT p.id, p.created_at, p.doc FROM projects p");

        if let Predicate::ScopeAndCollaborator(..) = &query.predicate {
            qb.push(" JOIN project_collaborators pc ON pc.project_id = p.id");
        }
        qb.push(" WHERE 1 = 1");

        match &query.predicate {
            Predicate::All => {}
            Predicate::Scope(scope) => {
                qb.push(" AND p.scope = ").push_bind(scope.as_str());
            }
            Predicate::Creator(user_id) => {
                qb.push(" AND p.creator_id = ").push_bind(user_id.clone());
            }
            Predicate::ScopeAndCreator(scope, user_id) => {
                qb.push(" AND p.scope = ").push_bind(scope.as_str());
                qb.push(" AND p.creator_id = ").push_bind(user_id.clone());
            }
            Predicate::ScopeAndCollaborator(scope, user_id) => {
                qb.push(" AND p.scope = ").push_bind(scope.as_str());
                qb.push(" AND pc.user_id = ").push_bind(user_id.clone());
            }
        }

        if let Some(state) = query.state {
            qb.push(" AND p.state = ").push_bind(state.as_str());
        }

        if let Some(cursor) = &query.start_after {
            qb.push(" AND (p.created_at < ")
                .push_bind(cursor.created_at)
                .push(" OR (p.created_at = ")
                .push_bind(cursor.created_at)
                .push(" AND p.id < ")
                .push_bind(cursor.id.clone())
                .push("))");
        }

        qb.push(" ORDER BY p.created_at DESC, p.id DESC");

        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = qb
            .build_query_as::<(String, i64, String)>()
            .fetch_all(&self.db.pool)
            .await?;

        rows.into_iter().map(into_document).collect()
    }

    /// Push subscription: the full matching snapshot is delivered at once
    /// and again after every store change. A failed query is delivered once
    /// and ends the listener.
    pub fn listen(&self, query: ProjectQuery) -> Listener {
        // Subscribe before the first read so no write can slip between them.
        let mut changes = self.changes.subscribe();
        let store = self.clone();
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);

        let task = tokio::spawn(async move {
            loop {
                match store.query(&query).await {
                    Ok(docs) => {
                        if tx.send(Ok(docs)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }

                match changes.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }

                // Coalesce a burst of writes into one snapshot.
                loop {
                    match changes.try_recv() {
                        Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
            }
        });

        Listener { rx, task }
    }
}

/// A live store subscription. Dropping it stops the underlying task.
pub struct Listener {
    rx: mpsc::Receiver<Result<Vec<StoredDocument>>>,
    task: JoinHandle<()>,
}

impl Listener {
    pub async fn next(&mut self) -> Option<Result<Vec<StoredDocument>>> {
        self.rx.recv().await
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn into_document((id, created_at, raw): (String, i64, String)) -> Result<StoredDocument> {
    Ok(StoredDocument {
        id,
        created_at,
        data: serde_json::from_str(&raw)?,
    })
}

fn array_field<'a>(doc: &'a mut Value, field: &str) -> Result<&'a mut Vec<Value>> {
    let object = doc
        .as_object_mut()
        .ok_or_else(|| AppError::Internal("Project document is not an object".to_string()))?;
    let slot = object
        .entry(field.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    slot.as_array_mut()
        .ok_or_else(|| AppError::Internal(format!("Field '{field}' is not an array")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn store() -> ProjectStore {
        ProjectStore::new(Database::in_memory().await.unwrap())
    }

    fn doc(scope: &str, creator: &str, created_at: i64) -> Value {
        json!({
            "title": format!("{scope} project at {created_at}"),
            "description": "",
            "scope": { "type": scope },
            "createdBy": creator,
            "createdAt": created_at,
        })
    }

    #[tokio::test]
    async fn test_query_orders_newest_first() {
        let store = store().await;
        for ts in [10, 30, 20] {
            store.insert_document(doc("local", "u1", ts)).await.unwrap();
        }

        let docs = store
            .query(&ProjectQuery::new(Predicate::All))
            .await
            .unwrap();
        let stamps: Vec<i64> = docs.iter().map(|d| d.created_at).collect();
        assert_eq!(stamps, vec![30, 20, 10]);
    }

    #[tokio::test]
    async fn test_cursor_resumes_after_last_record() {
        let store = store().await;
        for ts in 1..=5 {
            store.insert_document(doc("global", "u1", ts)).await.unwrap();
        }

        let first = store
            .query(&ProjectQuery::new(Predicate::Scope(Scope::Global)).with_limit(2))
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        let rest = store
            .query(
                &ProjectQuery::new(Predicate::Scope(Scope::Global))
                    .start_after(first.last().map(StoredDocument::cursor)),
            )
            .await
            .unwrap();
        let stamps: Vec<i64> = rest.iter().map(|d| d.created_at).collect();
        assert_eq!(stamps, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_cursor_breaks_timestamp_ties_by_id() {
        let store = store().await;
        for _ in 0..4 {
            store.insert_document(doc("state", "u1", 100)).await.unwrap();
        }

        let query = ProjectQuery::new(Predicate::Scope(Scope::State)).with_limit(2);
        let first = store.query(&query).await.unwrap();
        let second = store
            .query(&query.clone().start_after(first.last().map(StoredDocument::cursor)))
            .await
            .unwrap();

        let mut ids: Vec<String> = first.iter().chain(&second).map(|d| d.id.clone()).collect();
        assert_eq!(ids.len(), 4);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[tokio::test]
    async fn test_collaborator_predicate_uses_index() {
        let store = store().await;
        let mut shared = doc("grupal", "owner", 1);
        shared["collaborators"] = json!([{ "userId": "u2", "displayName": "Two", "role": "member" }]);
        store.insert_document(shared).await.unwrap();
        store.insert_document(doc("grupal", "owner", 2)).await.unwrap();

        let docs = store
            .query(&ProjectQuery::new(Predicate::ScopeAndCollaborator(
                Scope::Grupal,
                "u2".to_string(),
            )))
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].created_at, 1);
    }

    #[tokio::test]
    async fn test_array_mutators_replace_legacy_numbers() {
        let store = store().await;
        let mut legacy = doc("local", "u1", 1);
        legacy["supports"] = json!(7);
        let id = store.insert_document(legacy).await.unwrap();

        let updated = store.array_union(&id, "supports", json!("u2")).await.unwrap();
        assert_eq!(updated.data["supports"], json!(["u2"]));

        let updated = store.array_union(&id, "supports", json!("u2")).await.unwrap();
        assert_eq!(updated.data["supports"], json!(["u2"]));

        let updated = store.array_remove(&id, "supports", json!("u2")).await.unwrap();
        assert_eq!(updated.data["supports"], json!([]));
    }

    #[tokio::test]
    async fn test_insert_requires_index_fields() {
        let store = store().await;
        let err = store
            .insert_document(json!({ "title": "no scope", "createdBy": "u1" }))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_delete_reports_missing() {
        let store = store().await;
        let id = store.insert_document(doc("local", "u1", 1)).await.unwrap();
        assert!(store.delete(&id).await.unwrap());
        assert!(!store.delete(&id).await.unwrap());
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_listen_pushes_snapshot_after_change() {
        let store = store().await;
        store.insert_document(doc("local", "u1", 1)).await.unwrap();

        let mut listener = store.listen(ProjectQuery::new(Predicate::Scope(Scope::Local)));
        let initial = listener.next().await.unwrap().unwrap();
        assert_eq!(initial.len(), 1);

        store.insert_document(doc("local", "u1", 2)).await.unwrap();
        let pushed = listener.next().await.unwrap().unwrap();
        assert_eq!(pushed.len(), 2);
        assert_eq!(pushed[0].created_at, 2);
    }

    #[test]
    fn test_cursor_encoding() {
        let cursor = Cursor {
            created_at: 1700000000000,
            id: "3f2a-11".to_string(),
        };
        assert_eq!(Cursor::decode(&cursor.encode()).unwrap(), cursor);
        assert!(Cursor::decode("garbage").is_err());
        assert!(Cursor::decode("12_").is_err());
        assert!(Cursor::decode("x_abc").is_err());
    }
}
