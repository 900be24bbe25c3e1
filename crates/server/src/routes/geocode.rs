use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{AppError, Result},
    geo::{self, ParsedAddress},
    services::geocoding::GeocodedPlace,
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(forward))
        .route("/reverse", get(reverse))
}

#[derive(Debug, Deserialize)]
pub struct ForwardQuery {
    pub address: String,
}

#[derive(Debug, Deserialize)]
pub struct ReverseQuery {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceResponse {
    pub lat: f64,
    pub lng: f64,
    pub geohash: String,
    #[serde(flatten)]
    pub address: ParsedAddress,
}

impl From<GeocodedPlace> for PlaceResponse {
    fn from(place: GeocodedPlace) -> Self {
        Self {
            geohash: geo::encode_geohash(place.lat, place.lng, geo::DEFAULT_GEOHASH_PRECISION),
            lat: place.lat,
            lng: place.lng,
            address: place.address,
        }
    }
}

/// `null` when nothing was found or the provider is unavailable.
async fn forward(
    State(state): State<AppState>,
    Query(query): Query<ForwardQuery>,
) -> Result<Json<Option<PlaceResponse>>> {
    if query.address.trim().is_empty() {
        return Err(AppError::Validation("Address is required".to_string()));
    }
    let place = state.geocoding.forward(&query.address).await;
    Ok(Json(place.map(PlaceResponse::from)))
}

async fn reverse(
    State(state): State<AppState>,
    Query(query): Query<ReverseQuery>,
) -> Result<Json<Option<PlaceResponse>>> {
    let place = state.geocoding.reverse(query.lat, query.lng).await;
    Ok(Json(place.map(PlaceResponse::from)))
}
