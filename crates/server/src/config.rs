use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::feed::{DEFAULT_PAGE_SIZE, DEFAULT_STALE_AFTER};

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub storage_path: String,
    pub public_media_url: String,
    pub jwt_secret: String,
    /// Geocoding is disabled when unset.
    pub google_maps_api_key: Option<String>,
    pub feed_page_size: u32,
    pub feed_stale_after: Duration,
    pub geocode_min_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            database_url: "sqlite:./data/agora.db?mode=rwc".to_string(),
            storage_path: "./data/media".to_string(),
            public_media_url: "/media".to_string(),
            jwt_secret: "development-secret-change-in-production".to_string(),
            google_maps_api_key: None,
            feed_page_size: DEFAULT_PAGE_SIZE,
            feed_stale_after: DEFAULT_STALE_AFTER,
            geocode_min_interval: Duration::from_millis(1000),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            port: parse_var("PORT").unwrap_or(defaults.port),
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            storage_path: env::var("STORAGE_PATH").unwrap_or(defaults.storage_path),
            public_media_url: env::var("PUBLIC_MEDIA_URL").unwrap_or(defaults.public_media_url),
            jwt_secret: env::var("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            google_maps_api_key: env::var("GOOGLE_MAPS_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            feed_page_size: parse_var::<u32>("FEED_PAGE_SIZE")
                .filter(|size| *size > 0)
                .unwrap_or(defaults.feed_page_size),
            feed_stale_after: parse_var("FEED_STALE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.feed_stale_after),
            geocode_min_interval: parse_var("GEOCODE_MIN_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.geocode_min_interval),
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.feed_page_size, 20);
        assert_eq!(config.feed_stale_after, Duration::from_secs(300));
        assert!(config.google_maps_api_key.is_none());
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        env::set_var("AGORA_TEST_PARSE_VAR", "not-a-number");
        assert_eq!(parse_var::<u32>("AGORA_TEST_PARSE_VAR"), None);
        env::set_var("AGORA_TEST_PARSE_VAR", " 42 ");
        assert_eq!(parse_var::<u32>("AGORA_TEST_PARSE_VAR"), Some(42));
        env::remove_var("AGORA_TEST_PARSE_VAR");
    }
}
