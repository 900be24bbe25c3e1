// Geocoding service: a typed provider behind a cache and a throttle.
// Lookups never fail from the caller's point of view; any provider error
// resolves to "no result".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::async_trait;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::geo::{self, GeocodeResult, ParsedAddress};

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodedPlace {
    pub lat: f64,
    pub lng: f64,
    pub address: ParsedAddress,
}

impl GeocodedPlace {
    fn from_result(result: &GeocodeResult) -> Option<Self> {
        let location = result.geometry.as_ref()?.location;
        Some(Self {
            lat: location.lat,
            lng: location.lng,
            address: geo::parse_address_components(result),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GeocodeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider returned status {0}")]
    Status(String),
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn forward(&self, address: &str) -> Result<Vec<GeocodeResult>, GeocodeError>;

    async fn reverse(&self, lat: f64, lng: f64) -> Result<Vec<GeocodeResult>, GeocodeError>;
}

pub struct DisabledGeocoder;

#[async_trait]
impl Geocoder for DisabledGeocoder {
    async fn forward(&self, _address: &str) -> Result<Vec<GeocodeResult>, GeocodeError> {
        Ok(Vec::new())
    }

    async fn reverse(&self, _lat: f64, _lng: f64) -> Result<Vec<GeocodeResult>, GeocodeError> {
        Ok(Vec::new())
    }
}

const GOOGLE_GEOCODE_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";

#[derive(Debug, Deserialize)]
struct GoogleResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

pub struct GoogleGeocoder {
    client: reqwest::Client,
    api_key: String,
}

impl GoogleGeocoder {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }

    async fn request(&self, params: &[(&str, String)]) -> Result<Vec<GeocodeResult>, GeocodeError> {
        let response: GoogleResponse = self
            .client
            .get(GOOGLE_GEOCODE_URL)
            .query(params)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match response.status.as_str() {
            "OK" => Ok(response.results),
            "ZERO_RESULTS" => Ok(Vec::new()),
            other => Err(GeocodeError::Status(other.to_string())),
        }
    }
}

#[async_trait]
impl Geocoder for GoogleGeocoder {
    async fn forward(&self, address: &str) -> Result<Vec<GeocodeResult>, GeocodeError> {
        self.request(&[("address", address.to_string())]).await
    }

    async fn reverse(&self, lat: f64, lng: f64) -> Result<Vec<GeocodeResult>, GeocodeError> {
        self.request(&[("latlng", format!("{lat},{lng}"))]).await
    }
}

/// Spaces consecutive calls by at least `min_interval`, measured from the
/// previous call. Concurrent waiters are not queued.
struct Throttle {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl Throttle {
    async fn wait(&self) {
        let wait_for = {
            let last = self.last_call.lock().await;
            last.map(|at| self.min_interval.saturating_sub(at.elapsed()))
        };
        if let Some(delay) = wait_for.filter(|d| !d.is_zero()) {
            tokio::time::sleep(delay).await;
        }
        *self.last_call.lock().await = Some(Instant::now());
    }
}

#[derive(Clone)]
pub struct GeocodingService {
    provider: Arc<dyn Geocoder>,
    // Unbounded; entries live as long as the process.
    forward_cache: Arc<RwLock<HashMap<String, Option<GeocodedPlace>>>>,
    reverse_cache: Arc<RwLock<HashMap<String, Option<GeocodedPlace>>>>,
    throttle: Arc<Throttle>,
}

impl GeocodingService {
    pub fn new(provider: Arc<dyn Geocoder>, min_interval: Duration) -> Self {
        Self {
            provider,
            forward_cache: Arc::new(RwLock::new(HashMap::new())),
            reverse_cache: Arc::new(RwLock::new(HashMap::new())),
            throttle: Arc::new(Throttle {
                min_interval,
                last_call: Mutex::new(None),
            }),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(DisabledGeocoder), Duration::ZERO)
    }

    pub async fn forward(&self, address: &str) -> Option<GeocodedPlace> {
        let key = address.trim().to_lowercase();
        if key.is_empty() {
            return None;
        }
        if let Some(hit) = self.forward_cache.read().await.get(&key) {
            return hit.clone();
        }

        self.throttle.wait().await;
        let place = match self.provider.forward(address).await {
            Ok(results) => results.first().and_then(GeocodedPlace::from_result),
            Err(e) => {
                tracing::warn!(address, error = %e, "Forward geocoding failed");
                return None;
            }
        };

        self.forward_cache.write().await.insert(key, place.clone());
        place
    }

    pub async fn reverse(&self, lat: f64, lng: f64) -> Option<GeocodedPlace> {
        let key = coordinate_key(lat, lng);
        if let Some(hit) = self.reverse_cache.read().await.get(&key) {
            return hit.clone();
        }

        self.throttle.wait().await;
        let place = match self.provider.reverse(lat, lng).await {
            Ok(results) => results.first().map(|result| GeocodedPlace {
                lat,
                lng,
                address: geo::parse_address_components(result),
            }),
            Err(e) => {
                tracing::warn!(lat, lng, error = %e, "Reverse geocoding failed");
                return None;
            }
        };

        self.reverse_cache.write().await.insert(key, place.clone());
        place
    }
}

/// Coordinates truncated to four decimals, roughly 11 m.
fn coordinate_key(lat: f64, lng: f64) -> String {
    format!("{:.4},{:.4}", lat, lng)
}
