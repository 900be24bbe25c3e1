use std::collections::HashSet;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex as StdMutex,
};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::{
    filter_state::QueryFilterState,
    location_filter::LocationFilter,
    query::{FeedFilter, FeedPage, ProjectFeedQuery},
    sync::RealtimeProjectSync,
    FeedScope, DEFAULT_PAGE_SIZE, DEFAULT_STALE_AFTER,
};
use crate::{
    db::models::{LocationData, Project},
    error::Result,
    store::{Cursor, ProjectStore},
};

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSnapshot {
    pub scope: FeedScope,
    pub projects: Vec<Project>,
    pub has_more: bool,
    pub loading: bool,
}

struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        (!flag.swap(true, Ordering::AcqRel)).then_some(Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One caller's view of the project feed: scope switching with a
/// staleness policy, pagination, and a live subscription that keeps the
/// first page current.
pub struct ProjectFeedFacade {
    user_id: Option<String>,
    page_size: u32,
    filter_state: Arc<StdMutex<QueryFilterState>>,
    query: Mutex<ProjectFeedQuery>,
    sync: StdMutex<RealtimeProjectSync>,
    live_task: StdMutex<Option<JoinHandle<()>>>,
    snapshot: Arc<watch::Sender<FeedSnapshot>>,
    loading_more: AtomicBool,
    generation: AtomicU64,
    local_radius_km: Option<f64>,
}

impl ProjectFeedFacade {
    pub fn new(store: ProjectStore, user_id: Option<String>) -> Self {
        Self::with_settings(store, user_id, DEFAULT_PAGE_SIZE, DEFAULT_STALE_AFTER)
    }

    pub fn with_settings(
        store: ProjectStore,
        user_id: Option<String>,
        page_size: u32,
        stale_after: Duration,
    ) -> Self {
        let (snapshot, _) = watch::channel(FeedSnapshot::default());
        Self {
            user_id,
            page_size: page_size.max(1),
            filter_state: Arc::new(StdMutex::new(QueryFilterState::new(stale_after))),
            query: Mutex::new(ProjectFeedQuery::with_page_size(store.clone(), page_size)),
            sync: StdMutex::new(RealtimeProjectSync::new(store)),
            live_task: StdMutex::new(None),
            snapshot: Arc::new(snapshot),
            loading_more: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            local_radius_km: None,
        }
    }

    pub fn with_local_radius_km(mut self, radius_km: f64) -> Self {
        self.local_radius_km = Some(radius_km);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn current(&self) -> FeedSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn is_live(&self) -> bool {
        lock(&self.live_task)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Switch to `scope`. Fetches the first page and attaches a live
    /// subscription when the scope changed or the last query is stale;
    /// otherwise does nothing. Returns whether a fetch ran.
    pub async fn activate_scope(&self, scope: FeedScope) -> Result<bool> {
        {
            let mut state = lock(&self.filter_state);
            if !state.is_stale() && !state.has_scope_changed(scope) {
                tracing::debug!(%scope, "Feed is fresh, skipping query");
                return Ok(false);
            }
            state.set_scope(scope);
        }

        let filter = self.filter_for(scope);
        if self.fetch_first_page(filter.clone()).await? {
            self.attach_live(filter);
        }
        Ok(true)
    }

    // The live subscription is left in place.
    pub async fn refresh(&self) -> Result<()> {
        let scope = lock(&self.filter_state).selected_scope();
        self.fetch_first_page(self.filter_for(scope)).await?;
        Ok(())
    }

    /// Append the next page. Returns the number of projects added; zero when
    /// the feed is exhausted or another `load_more` is already running.
    pub async fn load_more(&self) -> Result<usize> {
        let has_more = self.snapshot.borrow().has_more;
        if !has_more {
            return Ok(0);
        }
        let Some(_guard) = InFlight::acquire(&self.loading_more) else {
            tracing::debug!("load_more already in flight");
            return Ok(0);
        };

        let generation = self.generation.load(Ordering::Acquire);
        self.snapshot.send_modify(|s| s.loading = true);

        let result = self.query.lock().await.load_more().await;
        let page = match result {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load more projects");
                self.snapshot.send_modify(|s| s.loading = false);
                return Err(e);
            }
        };

        if self.generation.load(Ordering::Acquire) != generation {
            tracing::debug!("Discarding page for a superseded feed");
            return Ok(0);
        }

        let scope = lock(&self.filter_state).selected_scope();
        let records = self.location_filter().apply(scope, page.records);
        let mut added = 0;
        self.snapshot.send_modify(|s| {
            let known: HashSet<String> = s.projects.iter().map(|p| p.id().to_string()).collect();
            for project in records {
                if !known.contains(project.id()) {
                    s.projects.push(project);
                    added += 1;
                }
            }
            s.has_more = page.has_more;
            s.loading = false;
        });
        Ok(added)
    }

    pub async fn set_location(&self, location: Option<LocationData>) -> Result<()> {
        let scope = {
            let mut state = lock(&self.filter_state);
            state.set_location(location);
            state.selected_scope()
        };
        match scope {
            FeedScope::Local | FeedScope::State | FeedScope::National => self.refresh().await,
            _ => Ok(()),
        }
    }

    pub fn deactivate(&self) {
        if let Some(task) = lock(&self.live_task).take() {
            task.abort();
        }
        lock(&self.sync).unsubscribe_all();
    }

    fn filter_for(&self, scope: FeedScope) -> FeedFilter {
        FeedFilter {
            location: lock(&self.filter_state).last_location().cloned(),
            ..FeedFilter::new(scope)
                .for_user(self.user_id.clone())
                .with_limit(self.page_size)
        }
    }

    fn location_filter(&self) -> LocationFilter {
        location_filter(&self.filter_state, self.local_radius_km)
    }

    // Later requests win: a response for an older request is dropped and
    // `false` returned.
    async fn fetch_first_page(&self, filter: FeedFilter) -> Result<bool> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.snapshot.send_modify(|s| {
            s.loading = true;
            if s.scope != filter.scope {
                s.scope = filter.scope;
                s.projects.clear();
                s.has_more = false;
            }
        });

        let result = self.query.lock().await.execute(filter.clone()).await;
        let page: FeedPage = match result {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(scope = %filter.scope, error = %e, "Feed query failed");
                if self.generation.load(Ordering::Acquire) == generation {
                    self.snapshot.send_modify(|s| s.loading = false);
                }
                return Err(e);
            }
        };

        if self.generation.load(Ordering::Acquire) != generation {
            tracing::debug!(scope = %filter.scope, "Discarding superseded feed response");
            return Ok(false);
        }

        lock(&self.filter_state).mark_queried();
        let records = self.location_filter().apply(filter.scope, page.records);
        self.snapshot.send_replace(FeedSnapshot {
            scope: filter.scope,
            projects: records,
            has_more: page.has_more,
            loading: false,
        });
        Ok(true)
    }

    fn attach_live(&self, filter: FeedFilter) {
        let mut live = {
            let mut sync = lock(&self.sync);
            sync.unsubscribe_all();
            sync.subscribe(&filter)
        };

        let snapshot = Arc::clone(&self.snapshot);
        let filter_state = Arc::clone(&self.filter_state);
        let local_radius_km = self.local_radius_km;
        let scope = filter.scope;

        let task = tokio::spawn(async move {
            while live.changed().await.is_ok() {
                let Some(window) = live.borrow_and_update().clone() else {
                    continue;
                };
                // Location may change while the subscription is live.
                let head = location_filter(&filter_state, local_radius_km)
                    .apply(scope, window.projects);
                snapshot.send_modify(|s| {
                    if s.scope == scope {
                        s.projects = merge_live_head(head, window.boundary.as_ref(), &s.projects);
                    }
                });
            }
        });

        if let Some(previous) = lock(&self.live_task).replace(task) {
            previous.abort();
        }
    }
}

impl Drop for ProjectFeedFacade {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.live_task).take() {
            task.abort();
        }
    }
}

/// Replace the head of the feed with a live snapshot. Paginated records
/// past the raw window boundary are kept; with no boundary the live window
/// holds every match and replaces the list.
pub fn merge_live_head(
    head: Vec<Project>,
    boundary: Option<&Cursor>,
    current: &[Project],
) -> Vec<Project> {
    let Some(boundary) = boundary else {
        return head;
    };
    let oldest = (boundary.created_at, boundary.id.as_str());

    let tail: Vec<Project> = {
        let live_ids: HashSet<&str> = head.iter().map(Project::id).collect();
        current
            .iter()
            .filter(|p| !live_ids.contains(p.id()))
            .filter(|p| (p.created_at, p.id()) < oldest)
            .cloned()
            .collect()
    };

    let mut merged = head;
    merged.extend(tail);
    merged
}

fn location_filter(state: &StdMutex<QueryFilterState>, radius_km: Option<f64>) -> LocationFilter {
    let filter = LocationFilter::new(lock(state).last_location().cloned());
    match radius_km {
        Some(radius) => filter.with_radius_km(radius),
        None => filter,
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{db::Database, feed::normalize::normalize_document, store::StoredDocument};

    async fn store() -> ProjectStore {
        ProjectStore::new(Database::in_memory().await.unwrap())
    }

    fn doc(scope: &str, created_at: i64) -> serde_json::Value {
        json!({
            "title": format!("{scope} {created_at}"),
            "description": "",
            "scope": { "type": scope },
            "createdBy": "someone",
            "createdAt": created_at,
        })
    }

    async fn wait_for<F>(rx: &mut watch::Receiver<FeedSnapshot>, mut done: F) -> FeedSnapshot
    where
        F: FnMut(&FeedSnapshot) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let current = rx.borrow_and_update();
                    if done(&current) {
                        return current.clone();
                    }
                }
                rx.changed().await.expect("facade dropped");
            }
        })
        .await
        .expect("timed out waiting for feed")
    }

    #[tokio::test]
    async fn test_activate_fetches_then_skips_while_fresh() {
        let store = store().await;
        for ts in 1..=3 {
            store.insert_document(doc("local", ts)).await.unwrap();
        }

        let feed = ProjectFeedFacade::new(store, Some("u1".to_string()));
        assert!(feed.activate_scope(FeedScope::Local).await.unwrap());
        assert_eq!(feed.current().projects.len(), 3);
        assert!(feed.is_live());

        assert!(!feed.activate_scope(FeedScope::Local).await.unwrap());
        assert!(feed.activate_scope(FeedScope::Global).await.unwrap());
        assert!(feed.current().projects.is_empty());
    }

    #[tokio::test]
    async fn test_activate_refetches_after_ttl() {
        let store = store().await;
        store.insert_document(doc("local", 1)).await.unwrap();

        let feed = ProjectFeedFacade::with_settings(
            store,
            None,
            DEFAULT_PAGE_SIZE,
            Duration::from_millis(200),
        );
        assert!(feed.activate_scope(FeedScope::Local).await.unwrap());
        assert!(!feed.activate_scope(FeedScope::Local).await.unwrap());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(feed.activate_scope(FeedScope::Local).await.unwrap());
    }

    #[tokio::test]
    async fn test_load_more_until_exhausted() {
        let store = store().await;
        for ts in 1..=25 {
            store.insert_document(doc("local", ts)).await.unwrap();
        }

        let feed = ProjectFeedFacade::new(store, None);
        feed.activate_scope(FeedScope::Local).await.unwrap();
        let first = feed.current();
        assert_eq!(first.projects.len(), 20);
        assert!(first.has_more);

        assert_eq!(feed.load_more().await.unwrap(), 5);
        let after = feed.current();
        assert_eq!(after.projects.len(), 25);
        assert!(!after.has_more);

        assert_eq!(feed.load_more().await.unwrap(), 0);
        assert_eq!(feed.current().projects.len(), 25);
    }

    #[tokio::test]
    async fn test_live_insert_reaches_snapshot() {
        let store = store().await;
        store.insert_document(doc("global", 1)).await.unwrap();

        let feed = ProjectFeedFacade::new(store.clone(), None);
        feed.activate_scope(FeedScope::Global).await.unwrap();
        let mut rx = feed.subscribe();

        store.insert_document(doc("global", 2)).await.unwrap();
        let snapshot = wait_for(&mut rx, |s| s.projects.len() == 2).await;
        assert_eq!(snapshot.projects[0].created_at, 2);

        feed.deactivate();
        assert!(!feed.is_live());
    }

    #[tokio::test]
    async fn test_refresh_ignores_staleness() {
        let store = store().await;
        let feed = ProjectFeedFacade::new(store.clone(), None);
        feed.activate_scope(FeedScope::National).await.unwrap();
        feed.deactivate();

        store.insert_document(doc("national", 1)).await.unwrap();
        assert!(feed.current().projects.is_empty());

        feed.refresh().await.unwrap();
        assert_eq!(feed.current().projects.len(), 1);
    }

    #[tokio::test]
    async fn test_location_narrows_local_feed() {
        let store = store().await;
        let mut near = doc("local", 1);
        near["scope"]["place"] = json!("Córdoba");
        let mut far = doc("local", 2);
        far["scope"]["place"] = json!("Rosario");
        store.insert_document(near).await.unwrap();
        store.insert_document(far).await.unwrap();

        let feed = ProjectFeedFacade::new(store, Some("u1".to_string()));
        feed.activate_scope(FeedScope::Local).await.unwrap();
        assert_eq!(feed.current().projects.len(), 2);

        let location = LocationData {
            city: Some("Córdoba".to_string()),
            ..LocationData::at(-31.4201, -64.1888)
        };
        feed.set_location(Some(location)).await.unwrap();
        let projects = feed.current().projects;
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].scope.place.as_deref(), Some("Córdoba"));
    }

    #[tokio::test]
    async fn test_live_push_keeps_tail_behind_hidden_records() {
        let store = store().await;
        for ts in 1..=25 {
            store.insert_document(doc("global", ts)).await.unwrap();
        }
        // Newest record belongs to another user's group: it takes a slot in
        // the live window but never reaches u1.
        store.insert_document(doc("grupal", 26)).await.unwrap();

        let feed = ProjectFeedFacade::new(store.clone(), Some("u1".to_string()));
        feed.activate_scope(FeedScope::All).await.unwrap();
        let first = feed.current();
        assert_eq!(first.projects.len(), 19);
        assert!(first.has_more);

        assert_eq!(feed.load_more().await.unwrap(), 6);
        assert_eq!(feed.current().projects.len(), 25);

        let mut rx = feed.subscribe();
        store.insert_document(doc("global", 27)).await.unwrap();
        let snapshot = wait_for(&mut rx, |s| s.projects.len() == 26).await;
        assert!(!snapshot.has_more);
        assert_eq!(snapshot.projects[0].created_at, 27);
        assert_eq!(snapshot.projects[25].created_at, 1);
    }

    #[test]
    fn test_merge_without_boundary_replaces_list() {
        let project = |created_at: i64, id: &str| {
            normalize_document(&StoredDocument {
                id: id.to_string(),
                created_at,
                data: doc("global", created_at),
            })
            .unwrap()
        };
        let current = vec![project(3, "c"), project(2, "b"), project(1, "a")];

        let head = vec![project(4, "d"), project(3, "c")];
        assert_eq!(merge_live_head(head.clone(), None, &current).len(), 2);

        let boundary = Cursor {
            created_at: 3,
            id: "c".to_string(),
        };
        let merged = merge_live_head(head, Some(&boundary), &current);
        let ids: Vec<&str> = merged.iter().map(Project::id).collect();
        assert_eq!(ids, vec!["d", "c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_later_scope_switch_wins() {
        let store = store().await;
        for ts in 1..=2 {
            store.insert_document(doc("local", ts)).await.unwrap();
        }
        store.insert_document(doc("global", 3)).await.unwrap();

        let feed = ProjectFeedFacade::new(store, Some("u1".to_string()));
        let (local, global) = tokio::join!(
            feed.activate_scope(FeedScope::Local),
            feed.activate_scope(FeedScope::Global),
        );
        assert!(local.unwrap());
        assert!(global.unwrap());

        let snapshot = feed.current();
        assert_eq!(snapshot.scope, FeedScope::Global);
        assert!(!snapshot.loading);
        assert_eq!(snapshot.projects.len(), 1);
        assert_eq!(snapshot.projects[0].title, "global 3");

        // Only the later scope's subscription is left running.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(feed.current().projects.len(), 1);
        assert_eq!(lock(&feed.sync).active_count(), 1);
    }

    #[tokio::test]
    async fn test_load_more_for_superseded_feed_is_dropped() {
        let store = store().await;
        for ts in 1..=25 {
            store.insert_document(doc("local", ts)).await.unwrap();
        }
        for ts in 26..=27 {
            store.insert_document(doc("global", ts)).await.unwrap();
        }

        let feed = ProjectFeedFacade::new(store, None);
        feed.activate_scope(FeedScope::Local).await.unwrap();
        assert!(feed.current().has_more);

        let (added, switched) =
            tokio::join!(feed.load_more(), feed.activate_scope(FeedScope::Global));
        assert_eq!(added.unwrap(), 0);
        assert!(switched.unwrap());

        let snapshot = feed.current();
        assert_eq!(snapshot.scope, FeedScope::Global);
        assert!(!snapshot.has_more);
        let titles: Vec<&str> = snapshot.projects.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["global 27", "global 26"]);
    }

    #[test]
    fn test_in_flight_guard() {
        let flag = AtomicBool::new(false);
        let guard = InFlight::acquire(&flag);
        assert!(guard.is_some());
        assert!(InFlight::acquire(&flag).is_none());
        drop(guard);
        assert!(InFlight::acquire(&flag).is_some());
    }
}
