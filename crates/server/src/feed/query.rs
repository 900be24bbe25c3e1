use std::collections::HashSet;

use super::{normalize::normalize_all, FeedScope, DEFAULT_PAGE_SIZE};
use crate::{
    db::models::{LocationData, Project, ProjectState, Scope},
    error::Result,
    store::{Cursor, Predicate, ProjectQuery, ProjectStore, StoredDocument},
};

#[derive(Debug, Clone, Default)]
pub struct FeedFilter {
    pub scope: FeedScope,
    pub user_id: Option<String>,
    pub location: Option<LocationData>,
    pub search: Option<String>,
    pub limit: Option<u32>,
    pub state: Option<ProjectState>,
}

impl FeedFilter {
    pub fn new(scope: FeedScope) -> Self {
        Self {
            scope,
            ..Self::default()
        }
    }

    pub fn for_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeedPage {
    pub records: Vec<Project>,
    /// True when the page came back exactly full. A result set that is an
    /// exact multiple of the page size therefore reports one extra, empty
    /// page.
    pub has_more: bool,
    pub cursor: Option<Cursor>,
}

impl FeedPage {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// The store predicates a feed scope expands to. More than one predicate
/// means the results are unioned; none means nothing can match.
pub fn scope_predicates(scope: FeedScope, user_id: Option<&str>) -> Vec<Predicate> {
    match (scope, user_id) {
        (FeedScope::All, _) => vec![Predicate::All],
        (FeedScope::MyProjects, Some(uid)) => vec![Predicate::Creator(uid.to_string())],
        (FeedScope::Grupal, Some(uid)) => vec![
            Predicate::ScopeAndCreator(Scope::Grupal, uid.to_string()),
            Predicate::ScopeAndCollaborator(Scope::Grupal, uid.to_string()),
        ],
        (FeedScope::MyProjects | FeedScope::Grupal, None) => Vec::new(),
        (named, _) => named
            .project_scope()
            .map(|scope| vec![Predicate::Scope(scope)])
            .unwrap_or_default(),
    }
}

pub fn union_documents<I>(sets: I) -> Vec<StoredDocument>
where
    I: IntoIterator<Item = Vec<StoredDocument>>,
{
    let mut seen = HashSet::new();
    let mut merged: Vec<StoredDocument> = sets
        .into_iter()
        .flatten()
        .filter(|doc| seen.insert(doc.id.clone()))
        .collect();
    merged.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    merged
}

/// Grupal projects are only ever shown to their participants, whichever
/// feed they surface in.
pub fn visible_to(project: &Project, user_id: Option<&str>) -> bool {
    if project.scope.kind != Scope::Grupal {
        return true;
    }
    user_id.is_some_and(|uid| project.is_participant(uid))
}

fn matches_search(project: &Project, search: Option<&str>) -> bool {
    let Some(needle) = search.map(str::trim).filter(|s| !s.is_empty()) else {
        return true;
    };
    let needle = needle.to_lowercase();
    project.title.to_lowercase().contains(&needle)
        || project.description.to_lowercase().contains(&needle)
}

pub fn finish_records(docs: &[StoredDocument], filter: &FeedFilter) -> Vec<Project> {
    let user_id = filter.user_id.as_deref();
    normalize_all(docs)
        .into_iter()
        .filter(|project| visible_to(project, user_id))
        .filter(|project| matches_search(project, filter.search.as_deref()))
        .collect()
}

/// Bounded, newest-first feed queries with forward-only pagination.
pub struct ProjectFeedQuery {
    store: ProjectStore,
    default_limit: u32,
    last_filter: Option<FeedFilter>,
    cursor: Option<Cursor>,
    has_more: bool,
}

impl ProjectFeedQuery {
    pub fn new(store: ProjectStore) -> Self {
        Self::with_page_size(store, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(store: ProjectStore, default_limit: u32) -> Self {
        Self {
            store,
            default_limit: default_limit.max(1),
            last_filter: None,
            cursor: None,
            has_more: false,
        }
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn page_size(&self, filter: &FeedFilter) -> u32 {
        filter.limit.unwrap_or(self.default_limit).max(1)
    }

    pub async fn execute(&mut self, filter: FeedFilter) -> Result<FeedPage> {
        let page = self.fetch(&filter, None).await?;
        self.cursor = page.cursor.clone();
        self.has_more = page.has_more;
        self.last_filter = Some(filter);
        Ok(page)
    }

    /// Next page after the stored cursor. Without a prior query, a cursor,
    /// or once the feed is exhausted this returns an empty page without
    /// touching the store.
    pub async fn load_more(&mut self) -> Result<FeedPage> {
        let (Some(filter), Some(cursor)) = (&self.last_filter, &self.cursor) else {
            return Ok(FeedPage::empty());
        };
        if !self.has_more {
            return Ok(FeedPage::empty());
        }

        let page = self.fetch(filter, Some(cursor.clone())).await?;
        if page.cursor.is_some() {
            self.cursor = page.cursor.clone();
        }
        self.has_more = page.has_more;
        Ok(page)
    }

    pub async fn fetch(&self, filter: &FeedFilter, start_after: Option<Cursor>) -> Result<FeedPage> {
        let limit = self.page_size(filter);
        let predicates = scope_predicates(filter.scope, filter.user_id.as_deref());
        if predicates.is_empty() {
            return Ok(FeedPage::empty());
        }

        let mut sets = Vec::with_capacity(predicates.len());
        for predicate in predicates {
            let query = ProjectQuery::new(predicate)
                .with_state(filter.state)
                .with_limit(limit)
                .start_after(start_after.clone());
            sets.push(self.store.query(&query).await?);
        }

        let mut docs = union_documents(sets);
        docs.truncate(limit as usize);

        let has_more = docs.len() == limit as usize;
        let cursor = docs.last().map(StoredDocument::cursor);
        let records = finish_records(&docs, filter);

        tracing::debug!(
            scope = %filter.scope,
            fetched = docs.len(),
            returned = records.len(),
            has_more,
            "Feed page fetched"
        );

        Ok(FeedPage {
            records,
            has_more,
            cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::db::Database;

    async fn store() -> ProjectStore {
        ProjectStore::new(Database::in_memory().await.unwrap())
    }

    fn doc(scope: &str, creator: &str, created_at: i64) -> Value {
        json!({
            "title": format!("{scope} #{created_at}"),
            "description": "",
            "scope": { "type": scope },
            "createdBy": creator,
            "createdAt": created_at,
        })
    }

    fn grupal_with_collaborator(creator: &str, collaborator: &str, created_at: i64) -> Value {
        let mut value = doc("grupal", creator, created_at);
        value["collaborators"] =
            json!([{ "userId": collaborator, "displayName": "C", "role": "member" }]);
        value
    }

    #[tokio::test]
    async fn test_local_feed_paginates_to_exhaustion() {
        let store = store().await;
        for ts in 1..=25 {
            store.insert_document(doc("local", "other", ts)).await.unwrap();
        }
        for ts in 100..105 {
            store.insert_document(doc("global", "other", ts)).await.unwrap();
        }

        let mut feed = ProjectFeedQuery::new(store);
        let first = feed
            .execute(FeedFilter::new(FeedScope::Local).for_user(Some("u1".to_string())))
            .await
            .unwrap();
        assert_eq!(first.records.len(), 20);
        assert!(first.has_more);
        let stamps: Vec<i64> = first.records.iter().map(|p| p.created_at).collect();
        assert_eq!(stamps, (6..=25).rev().collect::<Vec<_>>());

        let second = feed.load_more().await.unwrap();
        assert_eq!(second.records.len(), 5);
        assert!(!second.has_more);
        assert!(second.records.iter().all(|p| p.scope.kind == Scope::Local));
    }

    #[tokio::test]
    async fn test_exact_page_reports_more_then_stops() {
        let store = store().await;
        for ts in 1..=20 {
            store.insert_document(doc("state", "other", ts)).await.unwrap();
        }

        let mut feed = ProjectFeedQuery::new(store);
        let first = feed.execute(FeedFilter::new(FeedScope::State)).await.unwrap();
        assert_eq!(first.records.len(), 20);
        assert!(first.has_more);

        let second = feed.load_more().await.unwrap();
        assert!(second.records.is_empty());
        assert!(!second.has_more);
        assert!(!feed.has_more());

        let third = feed.load_more().await.unwrap();
        assert!(third.records.is_empty());
        assert!(!third.has_more);
    }

    #[tokio::test]
    async fn test_load_more_without_query_is_empty() {
        let mut feed = ProjectFeedQuery::new(store().await);
        let page = feed.load_more().await.unwrap();
        assert!(page.records.is_empty());
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_my_projects_filters_by_creator() {
        let store = store().await;
        store.insert_document(doc("local", "u1", 1)).await.unwrap();
        store.insert_document(doc("global", "u1", 2)).await.unwrap();
        store.insert_document(doc("local", "u2", 3)).await.unwrap();

        let feed = ProjectFeedQuery::new(store);
        let page = feed
            .fetch(
                &FeedFilter::new(FeedScope::MyProjects).for_user(Some("u1".to_string())),
                None,
            )
            .await
            .unwrap();
        assert_eq!(page.records.len(), 2);
        assert!(page.records.iter().all(|p| p.created_by == "u1"));

        let anonymous = feed
            .fetch(&FeedFilter::new(FeedScope::MyProjects), None)
            .await
            .unwrap();
        assert!(anonymous.records.is_empty());
    }

    #[tokio::test]
    async fn test_grupal_union_deduplicates() {
        let store = store().await;
        // Created by u1: three projects, one of which also lists u1 as
        // collaborator.
        store.insert_document(doc("grupal", "u1", 1)).await.unwrap();
        store.insert_document(doc("grupal", "u1", 2)).await.unwrap();
        store
            .insert_document(grupal_with_collaborator("u1", "u1", 3))
            .await
            .unwrap();
        // u1 collaborates on two projects by others.
        store
            .insert_document(grupal_with_collaborator("u2", "u1", 4))
            .await
            .unwrap();
        store
            .insert_document(grupal_with_collaborator("u3", "u1", 5))
            .await
            .unwrap();
        // Unrelated grupal project.
        store.insert_document(doc("grupal", "u4", 6)).await.unwrap();

        let feed = ProjectFeedQuery::new(store);
        let page = feed
            .fetch(
                &FeedFilter::new(FeedScope::Grupal)
                    .for_user(Some("u1".to_string()))
                    .with_limit(50),
                None,
            )
            .await
            .unwrap();

        // N = 3 by creator, M = 3 by collaborator, K = 1 overlap.
        assert_eq!(page.records.len(), 5);
        let ids: HashSet<&str> = page.records.iter().map(Project::id).collect();
        assert_eq!(ids.len(), 5);
        let stamps: Vec<i64> = page.records.iter().map(|p| p.created_at).collect();
        assert_eq!(stamps, vec![5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn test_grupal_hidden_from_outsiders() {
        let store = store().await;
        store
            .insert_document(grupal_with_collaborator("owner", "friend", 1))
            .await
            .unwrap();

        let feed = ProjectFeedQuery::new(store);
        for filter in [
            FeedFilter::new(FeedScope::Grupal).for_user(Some("stranger".to_string())),
            FeedFilter::new(FeedScope::Grupal),
            FeedFilter::new(FeedScope::All).for_user(Some("stranger".to_string())),
            FeedFilter::new(FeedScope::All),
        ] {
            let page = feed.fetch(&filter, None).await.unwrap();
            assert!(page.records.is_empty(), "{:?} leaked a grupal project", filter.scope);
        }

        for member in ["owner", "friend"] {
            let page = feed
                .fetch(
                    &FeedFilter::new(FeedScope::Grupal).for_user(Some(member.to_string())),
                    None,
                )
                .await
                .unwrap();
            assert_eq!(page.records.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive_post_filter() {
        let store = store().await;
        let mut plaza = doc("local", "u1", 1);
        plaza["title"] = json!("New Plaza benches");
        store.insert_document(plaza).await.unwrap();
        store.insert_document(doc("local", "u1", 2)).await.unwrap();

        let feed = ProjectFeedQuery::new(store);
        let filter = FeedFilter {
            search: Some("plaza".to_string()),
            ..FeedFilter::new(FeedScope::Local)
        };
        let page = feed.fetch(&filter, None).await.unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].title, "New Plaza benches");
    }

    #[tokio::test]
    async fn test_state_filter() {
        let store = store().await;
        let mut done = doc("global", "u1", 1);
        done["state"] = json!("done");
        store.insert_document(done).await.unwrap();
        store.insert_document(doc("global", "u1", 2)).await.unwrap();

        let feed = ProjectFeedQuery::new(store);
        let filter = FeedFilter {
            state: Some(ProjectState::Done),
            ..FeedFilter::new(FeedScope::Global)
        };
        let page = feed.fetch(&filter, None).await.unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].state, ProjectState::Done);
    }

    #[test]
    fn test_union_documents_counts() {
        let make = |id: &str, ts: i64| StoredDocument {
            id: id.to_string(),
            created_at: ts,
            data: Value::Null,
        };
        let merged = union_documents(vec![
            vec![make("a", 3), make("b", 2)],
            vec![make("b", 2), make("c", 1), make("d", 4)],
        ]);
        let ids: Vec<&str> = merged.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d", "a", "b", "c"]);
    }
}
