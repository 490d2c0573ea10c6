//! Static route data client.
//!
//! Routes are served as GeoJSON files, one per vehicle:
//! `{base}/route_{file}.geojson` with a single Feature whose geometry is the
//! route polyline and whose properties carry the ordered stop list.

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Route file not found for vehicle {0}")]
    NotFound(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Route file contains no features")]
    EmptyCollection,
}

/// A stop as declared in the route GeoJSON properties
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStop {
    pub stop_id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

/// Resolved route geometry and stop metadata for one vehicle
#[derive(Debug, Clone)]
pub struct RouteData {
    /// Polyline waypoints as [lat, lon]
    pub waypoints: Vec<[f64; 2]>,
    pub stops: Vec<RouteStop>,
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    geometry: Geometry,
    properties: FeatureProperties,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    /// GeoJSON positions, [lon, lat]
    coordinates: Vec<[f64; 2]>,
}

#[derive(Debug, Deserialize)]
struct FeatureProperties {
    #[serde(default)]
    stops: Vec<RouteStop>,
}

/// HTTP client for route GeoJSON files
#[derive(Clone)]
pub struct RouteClient {
    client: Client,
    base_url: String,
    /// Vehicle id -> route file alias; vehicles without an alias use their id
    aliases: HashMap<String, String>,
}

impl RouteClient {
    pub fn new(base_url: &str, aliases: HashMap<String, String>) -> Result<Self, RouteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RouteError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            aliases,
        })
    }

    /// Fetch and parse the route for one vehicle.
    pub async fn load(&self, vehicle_id: &str) -> Result<RouteData, RouteError> {
        let file = self
            .aliases
            .get(vehicle_id)
            .map(String::as_str)
            .unwrap_or(vehicle_id);
        let url = format!("{}/route_{}.geojson", self.base_url, file);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RouteError::Network(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(RouteError::NotFound(vehicle_id.to_string()));
        }
        let response = response
            .error_for_status()
            .map_err(|e| RouteError::Network(e.to_string()))?;

        let collection: FeatureCollection = response
            .json()
            .await
            .map_err(|e| RouteError::Parse(e.to_string()))?;

        let feature = collection
            .features
            .into_iter()
            .next()
            .ok_or(RouteError::EmptyCollection)?;

        Ok(RouteData {
            waypoints: normalize_waypoints(&feature.geometry.coordinates),
            stops: feature.properties.stops,
        })
    }
}

/// GeoJSON stores positions as [longitude, latitude]; everything downstream
/// works in [latitude, longitude]. This is the only place the axes swap.
fn normalize_waypoints(coordinates: &[[f64; 2]]) -> Vec<[f64; 2]> {
    coordinates.iter().map(|[lon, lat]| [*lat, *lon]).collect()
}
