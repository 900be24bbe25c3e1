// The filtered project feed: scope selection, paginated queries, live
// subscriptions and the per-caller facade.

pub mod facade;
pub mod filter_state;
pub mod location_filter;
pub mod normalize;
pub mod query;
pub mod sync;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{db::models::Scope, error::AppError};

pub use facade::{FeedSnapshot, ProjectFeedFacade};
pub use filter_state::QueryFilterState;
pub use location_filter::LocationFilter;
pub use query::{FeedFilter, FeedPage, ProjectFeedQuery};
pub use sync::{LiveWindow, RealtimeProjectSync, SubscriptionKey};

pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// First page of the home feed is smaller than later pages.
pub const HOME_FEED_INITIAL_PAGE_SIZE: u32 = 8;

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// What a caller asks the feed for. A superset of [`Scope`] with the two
/// pseudo-scopes `all` and `my-projects`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FeedScope {
    #[default]
    All,
    MyProjects,
    Grupal,
    Local,
    State,
    National,
    Global,
}

impl FeedScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedScope::All => "all",
            FeedScope::MyProjects => "my-projects",
            FeedScope::Grupal => "grupal",
            FeedScope::Local => "local",
            FeedScope::State => "state",
            FeedScope::National => "national",
            FeedScope::Global => "global",
        }
    }

    pub fn project_scope(&self) -> Option<Scope> {
        match self {
            FeedScope::All | FeedScope::MyProjects => None,
            FeedScope::Grupal => Some(Scope::Grupal),
            FeedScope::Local => Some(Scope::Local),
            FeedScope::State => Some(Scope::State),
            FeedScope::National => Some(Scope::National),
            FeedScope::Global => Some(Scope::Global),
        }
    }
}

impl From<Scope> for FeedScope {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Grupal => FeedScope::Grupal,
            Scope::Local => FeedScope::Local,
            Scope::State => FeedScope::State,
            Scope::National => FeedScope::National,
            Scope::Global => FeedScope::Global,
        }
    }
}

impl fmt::Display for FeedScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedScope {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(FeedScope::All),
            "my-projects" => Ok(FeedScope::MyProjects),
            other => other.parse::<Scope>().map(FeedScope::from),
        }
    }
}
