// User profiles: login bookkeeping, saved location and photo.

use chrono::Utc;
use sqlx::SqlitePool;

use crate::{
    db::models::{LocationData, UserProfile, UserRow},
    error::{AppError, Result},
    geo,
    services::geocoding::GeocodingService,
    store::now_ms,
};

const PROFILE_COLUMNS: &str =
    "id, email, name, photo_url, location, stats, created_at, last_login_at";

pub async fn get_profile(pool: &SqlitePool, user_id: &str) -> Result<UserProfile> {
    let row = sqlx::query_as::<_, UserRow>(&format!(
        "SELECT {PROFILE_COLUMNS} FROM users WHERE id = ?"
    ))
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

    Ok(row.into_profile())
}

pub async fn record_login(pool: &SqlitePool, user_id: &str) -> Result<()> {
    sqlx::query("UPDATE users SET last_login_at = ? WHERE id = ?")
        .bind(Utc::now().to_rfc3339())
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Fill in what the client left out: geohash always, address fields from
/// a reverse lookup when the city is missing.
pub async fn resolve_location(
    geocoding: &GeocodingService,
    mut location: LocationData,
) -> Result<LocationData> {
    if !(-90.0..=90.0).contains(&location.lat) || !(-180.0..=180.0).contains(&location.lng) {
        return Err(AppError::Validation("Coordinates out of range".to_string()));
    }

    if location.city.is_none() {
        if let Some(place) = geocoding.reverse(location.lat, location.lng).await {
            let address = place.address;
            location.city = address.city;
            location.state = location.state.or(address.state);
            location.country = location.country.or(address.country);
            location.country_code = location.country_code.or(address.country_code);
            location.formatted_address = location.formatted_address.or(address.formatted_address);
        }
    }

    location.geohash = Some(geo::encode_geohash(
        location.lat,
        location.lng,
        geo::DEFAULT_GEOHASH_PRECISION,
    ));
    if location.timestamp == 0 {
        location.timestamp = now_ms();
    }
    Ok(location)
}

pub async fn update_location(
    pool: &SqlitePool,
    geocoding: &GeocodingService,
    user_id: &str,
    location: LocationData,
) -> Result<UserProfile> {
    let location = resolve_location(geocoding, location).await?;
    let result = sqlx::query("UPDATE users SET location = ? WHERE id = ?")
        .bind(serde_json::to_string(&location)?)
        .bind(user_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("User not found".to_string()));
    }

    tracing::debug!(user_id, geohash = ?location.geohash, "Location saved");
    get_profile(pool, user_id).await
}

pub async fn update_photo(pool: &SqlitePool, user_id: &str, photo_url: &str) -> Result<UserProfile> {
    sqlx::query("UPDATE users SET photo_url = ? WHERE id = ?")
        .bind(photo_url)
        .bind(user_id)
        .execute(pool)
        .await?;
    get_profile(pool, user_id).await
}
