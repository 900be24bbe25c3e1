// Geographic helpers: great-circle distance, geohash cells and geocoder
// address parsing.

use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

// Seven characters is roughly a 150 m cell.
pub const DEFAULT_GEOHASH_PRECISION: usize = 7;

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Haversine great-circle distance in kilometers. NaN inputs yield NaN.
pub fn distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Standard base-32 geohash: longitude and latitude bisections interleaved,
/// longitude first, five bits per character.
pub fn encode_geohash(lat: f64, lon: f64, precision: usize) -> String {
    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lon_range = (-180.0_f64, 180.0_f64);
    let mut hash = String::with_capacity(precision);

    let mut bits = 0u8;
    let mut bit_count = 0;
    let mut even = true;

    while hash.len() < precision {
        let (range, value) = if even {
            (&mut lon_range, lon)
        } else {
            (&mut lat_range, lat)
        };
        let mid = (range.0 + range.1) / 2.0;
        bits <<= 1;
        if value >= mid {
            bits |= 1;
            range.0 = mid;
        } else {
            range.1 = mid;
        }
        even = !even;
        bit_count += 1;

        if bit_count == 5 {
            hash.push(BASE32[bits as usize] as char);
            bits = 0;
            bit_count = 0;
        }
    }

    hash
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeohashCell {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl GeohashCell {
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lng >= self.min_lng && lng <= self.max_lng
    }
}

/// Returns `None` for an empty hash or one with characters outside the
/// geohash alphabet.
pub fn decode_geohash(hash: &str) -> Option<GeohashCell> {
    if hash.is_empty() {
        return None;
    }

    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lon_range = (-180.0_f64, 180.0_f64);
    let mut even = true;

    for ch in hash.bytes() {
        let ch = ch.to_ascii_lowercase();
        let value = BASE32.iter().position(|&b| b == ch)?;
        for shift in (0..5).rev() {
            let bit = (value >> shift) & 1;
            let range = if even { &mut lon_range } else { &mut lat_range };
            let mid = (range.0 + range.1) / 2.0;
            if bit == 1 {
                range.0 = mid;
            } else {
                range.1 = mid;
            }
            even = !even;
        }
    }

    Some(GeohashCell {
        min_lat: lat_range.0,
        max_lat: lat_range.1,
        min_lng: lon_range.0,
        max_lng: lon_range.1,
    })
}

// Geocoder response shapes (Google Geocoding JSON).

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AddressComponent {
    pub long_name: String,
    pub short_name: String,
    #[serde(default)]
    pub types: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Geometry {
    pub location: LatLng,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeocodeResult {
    #[serde(default)]
    pub address_components: Vec<AddressComponent>,
    #[serde(default)]
    pub formatted_address: Option<String>,
    #[serde(default)]
    pub geometry: Option<Geometry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedAddress {
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub formatted_address: Option<String>,
}

/// Best-effort city/state/country extraction. City prefers `locality`
/// and falls back to the next broader administrative level.
pub fn parse_address_components(result: &GeocodeResult) -> ParsedAddress {
    let find = |kind: &str| {
        result
            .address_components
            .iter()
            .find(|c| c.types.iter().any(|t| t == kind))
    };

    let city = ["locality", "administrative_area_level_2", "administrative_area_level_1"]
        .iter()
        .find_map(|kind| find(*kind))
        .map(|c| c.long_name.clone());
    let state = find("administrative_area_level_1").map(|c| c.long_name.clone());
    let country = find("country");

    ParsedAddress {
        city,
        state,
        country: country.map(|c| c.long_name.clone()),
        country_code: country.map(|c| c.short_name.clone()),
        formatted_address: result.formatted_address.clone(),
    }
}
