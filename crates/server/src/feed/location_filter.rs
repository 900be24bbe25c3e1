// Proximity post-filter, run on the records a feed query returns.

use super::FeedScope;
use crate::{
    db::models::{LocationData, Project},
    geo,
};

pub const DEFAULT_LOCAL_RADIUS_KM: f64 = 50.0;

#[derive(Debug, Clone)]
pub struct LocationFilter {
    location: Option<LocationData>,
    local_radius_km: f64,
}

impl Default for LocationFilter {
    fn default() -> Self {
        Self::new(None)
    }
}

impl LocationFilter {
    pub fn new(location: Option<LocationData>) -> Self {
        Self {
            location,
            local_radius_km: DEFAULT_LOCAL_RADIUS_KM,
        }
    }

    pub fn with_radius_km(mut self, radius_km: f64) -> Self {
        self.local_radius_km = radius_km;
        self
    }

    /// Without a caller location, or for scopes that are not about place,
    /// every project passes. Projects with no location information pass
    /// too, since nothing can be said about them.
    pub fn matches(&self, scope: FeedScope, project: &Project) -> bool {
        let Some(here) = &self.location else {
            return true;
        };

        match scope {
            FeedScope::Local => {
                if let Some(point) = &project.scope.location {
                    return geo::distance_km(here.lat, here.lng, point.lat, point.lng)
                        <= self.local_radius_km;
                }
                place_matches(project, here.city.as_deref())
            }
            FeedScope::State => place_matches(project, here.state.as_deref()),
            FeedScope::National => place_matches(project, here.country.as_deref()),
            FeedScope::All | FeedScope::MyProjects | FeedScope::Grupal | FeedScope::Global => true,
        }
    }

    pub fn apply(&self, scope: FeedScope, projects: Vec<Project>) -> Vec<Project> {
        if self.location.is_none() {
            return projects;
        }
        projects
            .into_iter()
            .filter(|project| self.matches(scope, project))
            .collect()
    }
}

fn place_matches(project: &Project, wanted: Option<&str>) -> bool {
    match (project.scope.place.as_deref(), wanted) {
        (Some(place), Some(wanted)) => {
            let place = place.to_lowercase();
            let wanted = wanted.to_lowercase();
            place.contains(&wanted) || wanted.contains(&place)
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{CreatorInfo, GeoPoint, ProjectScope, ProjectState, Scope};

    fn project(place: Option<&str>, point: Option<(f64, f64)>) -> Project {
        Project {
            id: Some("p".to_string()),
            title: "t".to_string(),
            description: String::new(),
            scope: ProjectScope {
                kind: Scope::Local,
                place: place.map(str::to_string),
                location: point.map(|(lat, lng)| GeoPoint {
                    lat,
                    lng,
                    geohash: geo::encode_geohash(lat, lng, geo::DEFAULT_GEOHASH_PRECISION),
                }),
            },
            state: ProjectState::Building,
            created_by: "u1".to_string(),
            creator: CreatorInfo {
                id: "u1".to_string(),
                display_name: "Ana".to_string(),
                photo_url: None,
            },
            supports: vec![],
            opposes: vec![],
            verifies: vec![],
            followers: vec![],
            comments: vec![],
            collaborators: vec![],
            collaboration_requests: vec![],
            media: vec![],
            created_at: 1,
            updated_at: 1,
        }
    }

    fn cordoba() -> LocationData {
        LocationData {
            city: Some("Córdoba".to_string()),
            state: Some("Córdoba".to_string()),
            country: Some("Argentina".to_string()),
            ..LocationData::at(-31.4201, -64.1888)
        }
    }

    #[test]
    fn test_local_uses_distance_when_coordinates_exist() {
        let filter = LocationFilter::new(Some(cordoba()));
        // Villa Carlos Paz, about 30 km away.
        assert!(filter.matches(FeedScope::Local, &project(None, Some((-31.4241, -64.4978)))));
        // Buenos Aires.
        assert!(!filter.matches(FeedScope::Local, &project(None, Some((-34.6037, -58.3816)))));
    }

    #[test]
    fn test_local_falls_back_to_place_name() {
        let filter = LocationFilter::new(Some(cordoba()));
        assert!(filter.matches(FeedScope::Local, &project(Some("córdoba capital"), None)));
        assert!(!filter.matches(FeedScope::Local, &project(Some("Rosario"), None)));
        assert!(filter.matches(FeedScope::Local, &project(None, None)));
    }

    #[test]
    fn test_radius_is_configurable() {
        let filter = LocationFilter::new(Some(cordoba())).with_radius_km(10.0);
        assert!(!filter.matches(FeedScope::Local, &project(None, Some((-31.4241, -64.4978)))));
    }

    #[test]
    fn test_national_and_global() {
        let filter = LocationFilter::new(Some(cordoba()));
        assert!(filter.matches(FeedScope::National, &project(Some("Argentina"), None)));
        assert!(!filter.matches(FeedScope::National, &project(Some("Chile"), None)));
        assert!(filter.matches(FeedScope::Global, &project(Some("Chile"), None)));
    }

    #[test]
    fn test_no_location_passes_everything() {
        let filter = LocationFilter::default();
        let kept = filter.apply(
            FeedScope::Local,
            vec![project(Some("Rosario"), None), project(None, Some((0.0, 0.0)))],
        );
        assert_eq!(kept.len(), 2);
    }
}
