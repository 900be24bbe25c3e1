use std::time::Duration;

use tokio::time::Instant;

use super::{FeedScope, DEFAULT_STALE_AFTER};
use crate::db::models::LocationData;

/// The caller's current scope selection and when the feed was last
/// queried. Staleness is a plain wall-clock TTL with no dependency tracking.
#[derive(Debug, Clone)]
pub struct QueryFilterState {
    selected_scope: FeedScope,
    last_query: Option<Instant>,
    last_location: Option<LocationData>,
    stale_after: Duration,
}

impl Default for QueryFilterState {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER)
    }
}

impl QueryFilterState {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            selected_scope: FeedScope::All,
            last_query: None,
            last_location: None,
            stale_after,
        }
    }

    pub fn selected_scope(&self) -> FeedScope {
        self.selected_scope
    }

    pub fn set_scope(&mut self, scope: FeedScope) {
        self.selected_scope = scope;
    }

    pub fn has_scope_changed(&self, candidate: FeedScope) -> bool {
        self.selected_scope != candidate
    }

    pub fn is_stale(&self) -> bool {
        match self.last_query {
            None => true,
            Some(at) => at.elapsed() > self.stale_after,
        }
    }

    pub fn mark_queried(&mut self) {
        self.last_query = Some(Instant::now());
    }

    pub fn last_location(&self) -> Option<&LocationData> {
        self.last_location.as_ref()
    }

    pub fn set_location(&mut self, location: Option<LocationData>) {
        self.last_location = location;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let state = QueryFilterState::default();
        assert_eq!(state.selected_scope(), FeedScope::All);
        assert!(state.is_stale());
        assert!(state.last_location().is_none());
    }

    #[test]
    fn test_scope_change_detection() {
        let mut state = QueryFilterState::default();
        assert!(state.has_scope_changed(FeedScope::Local));
        state.set_scope(FeedScope::Local);
        assert!(!state.has_scope_changed(FeedScope::Local));
        assert!(state.has_scope_changed(FeedScope::Global));
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_window() {
        let mut state = QueryFilterState::default();
        state.mark_queried();
        assert!(!state.is_stale());

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!state.is_stale());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(state.is_stale());
    }
}
