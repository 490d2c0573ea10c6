use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// WebSocket URL of the GPS position feed
    #[serde(default = "Config::default_gps_ws_url")]
    pub gps_ws_url: String,
    /// WebSocket URL of the arrival/ETA prediction feed
    #[serde(default = "Config::default_eta_ws_url")]
    pub eta_ws_url: String,
    /// Base URL of the static route GeoJSON host
    #[serde(default = "Config::default_route_base_url")]
    pub route_base_url: String,
    /// Vehicle id -> route file alias; `route_{alias}.geojson` is fetched
    /// for aliased vehicles, `route_{vehicle_id}.geojson` otherwise
    #[serde(default)]
    pub route_aliases: HashMap<String, String>,
    /// Address the API server listens on
    #[serde(default = "Config::default_listen_addr")]
    pub listen_addr: String,
    /// Allowed CORS origins. Required unless cors_permissive is true.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Explicitly allow all origins (development only). Defaults to false.
    #[serde(default)]
    pub cors_permissive: bool,
    /// Live tracking behavior
    #[serde(default)]
    pub tracking: TrackingConfig,
}

/// Tuning for the live state synchronization engine
#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// Minimum movement in meters before a new position is accepted
    /// (default: 15). Smaller jumps are treated as GPS jitter.
    #[serde(default = "TrackingConfig::default_jitter_meters")]
    pub jitter_meters: f64,
    /// Base feed reconnect delay in milliseconds (default: 1000)
    #[serde(default = "TrackingConfig::default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    /// Maximum feed reconnect delay in milliseconds (default: 30000)
    #[serde(default = "TrackingConfig::default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            jitter_meters: Self::default_jitter_meters(),
            reconnect_base_ms: Self::default_reconnect_base_ms(),
            reconnect_max_ms: Self::default_reconnect_max_ms(),
        }
    }
}

impl TrackingConfig {
    fn default_jitter_meters() -> f64 {
        15.0
    }
    fn default_reconnect_base_ms() -> u64 {
        1_000
    }
    fn default_reconnect_max_ms() -> u64 {
        30_000
    }
}

impl Config {
    fn default_gps_ws_url() -> String {
        "ws://localhost:8080/ws/gps".to_string()
    }
    fn default_eta_ws_url() -> String {
        "ws://localhost:8080/ws/eta".to_string()
    }
    fn default_route_base_url() -> String {
        "http://localhost:8000".to_string()
    }
    fn default_listen_addr() -> String {
        "0.0.0.0:3000".to_string()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        let mut config: Config =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Base URLs can be overridden per deployment without editing the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("BUSTRACK_GPS_WS_URL") {
            self.gps_ws_url = url;
        }
        if let Ok(url) = std::env::var("BUSTRACK_ETA_WS_URL") {
            self.eta_ws_url = url;
        }
        if let Ok(url) = std::env::var("BUSTRACK_ROUTE_BASE_URL") {
            self.route_base_url = url;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
}
