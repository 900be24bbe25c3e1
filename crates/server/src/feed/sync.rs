// Live feed subscriptions. Each one owns a store listener per scope
// predicate (two for grupal) and republishes the union of their latest
// snapshots through a `watch` channel.

use std::collections::HashMap;

use futures::{stream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{
    query::{finish_records, scope_predicates, union_documents, FeedFilter},
    FeedScope,
};
use crate::{
    db::models::{Project, ProjectState},
    store::{Cursor, ProjectQuery, ProjectStore, StoredDocument},
};

// One subscription per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub scope: FeedScope,
    pub user_id: Option<String>,
    pub state: Option<ProjectState>,
}

impl SubscriptionKey {
    pub fn for_filter(filter: &FeedFilter) -> Self {
        Self {
            scope: filter.scope,
            user_id: filter.user_id.clone(),
            state: filter.state,
        }
    }
}

/// The visible projects of the live window. `boundary` is the position of
/// the oldest raw record when the window was filled to its limit, so
/// matches older than it may exist; `None` means the window holds every
/// match.
#[derive(Debug, Clone, Default)]
pub struct LiveWindow {
    pub projects: Vec<Project>,
    pub boundary: Option<Cursor>,
}

// `None` until the first snapshot arrives.
pub type LiveSnapshot = Option<LiveWindow>;

struct ActiveSubscription {
    task: JoinHandle<()>,
    snapshots: watch::Receiver<LiveSnapshot>,
}

impl Drop for ActiveSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct RealtimeProjectSync {
    store: ProjectStore,
    subscriptions: HashMap<SubscriptionKey, ActiveSubscription>,
}

impl RealtimeProjectSync {
    pub fn new(store: ProjectStore) -> Self {
        Self {
            store,
            subscriptions: HashMap::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_active(&self, key: &SubscriptionKey) -> bool {
        self.subscriptions
            .get(key)
            .is_some_and(|sub| !sub.task.is_finished())
    }

    pub fn snapshot(&self, key: &SubscriptionKey) -> LiveSnapshot {
        self.subscriptions
            .get(key)
            .and_then(|sub| sub.snapshots.borrow().clone())
    }

    // Replaces any existing subscription with the same key.
    pub fn subscribe(&mut self, filter: &FeedFilter) -> watch::Receiver<LiveSnapshot> {
        let key = SubscriptionKey::for_filter(filter);
        if self.subscriptions.remove(&key).is_some() {
            tracing::debug!(?key, "Replacing live subscription");
        }

        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(run_subscription(
            self.store.clone(),
            filter.clone(),
            key.clone(),
            tx,
        ));

        self.subscriptions.insert(
            key,
            ActiveSubscription {
                task,
                snapshots: rx.clone(),
            },
        );
        rx
    }

    pub fn unsubscribe(&mut self, key: &SubscriptionKey) -> bool {
        self.subscriptions.remove(key).is_some()
    }

    pub fn unsubscribe_all(&mut self) {
        self.subscriptions.clear();
    }
}

async fn run_subscription(
    store: ProjectStore,
    filter: FeedFilter,
    key: SubscriptionKey,
    tx: watch::Sender<LiveSnapshot>,
) {
    let predicates = scope_predicates(filter.scope, filter.user_id.as_deref());
    if predicates.is_empty() {
        let _ = tx.send(Some(LiveWindow::default()));
        return;
    }

    let branches = predicates.len();
    let listeners = predicates.into_iter().enumerate().map(|(branch, predicate)| {
        let mut query = ProjectQuery::new(predicate).with_state(filter.state);
        if let Some(limit) = filter.limit {
            query = query.with_limit(limit);
        }
        let listener = store.listen(query);
        stream::unfold(listener, |mut listener| async move {
            listener.next().await.map(|item| (item, listener))
        })
        .map(move |item| (branch, item))
        .boxed()
    });
    let mut events = stream::select_all(listeners);

    let mut latest: Vec<Option<Vec<StoredDocument>>> = vec![None; branches];

    while let Some((branch, item)) = events.next().await {
        match item {
            Ok(docs) => {
                latest[branch] = Some(docs);
                let mut merged = union_documents(latest.iter().flatten().cloned());
                let mut boundary = None;
                if let Some(limit) = filter.limit.map(|l| l as usize) {
                    // Decided on raw documents, before visibility and search
                    // filtering shrink the set.
                    if merged.len() >= limit {
                        merged.truncate(limit);
                        boundary = merged.last().map(StoredDocument::cursor);
                    }
                }
                let window = LiveWindow {
                    projects: finish_records(&merged, &filter),
                    boundary,
                };
                if tx.send(Some(window)).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(?key, error = %e, "Live project listener failed, results will stop updating");
                break;
            }
        }
    }
}
