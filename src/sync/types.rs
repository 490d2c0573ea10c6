//! Type definitions for the sync engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use utoipa::ToSchema;

/// Seat capacity assumed until fleet metadata supplies a real value
pub const DEFAULT_CAPACITY: u32 = 50;

/// Placeholder shown for display fields that have no data yet
const PLACEHOLDER: &str = "–";

/// Operating status of a vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum VehicleStatus {
    Active,
    Delayed,
    Completed,
}

/// One stop along a vehicle's route
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct StopState {
    /// Stable stop identifier from the route data
    pub id: String,
    pub name: String,
    /// [latitude, longitude]
    pub coordinates: [f64; 2],
    /// Whether the vehicle has passed this stop; never reverts to false
    pub completed: bool,
    /// Confirmed departure from this stop (epoch ms); set when completed
    pub departure_time: Option<i64>,
    /// Most recent ETA prediction (epoch ms); cleared once the stop completes
    pub estimated_time: Option<i64>,
}

/// Canonical per-vehicle snapshot. Replaced wholesale on every merge so
/// concurrent readers never observe a half-updated vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct VehicleState {
    pub id: String,
    pub display_name: String,
    /// Name of the first stop on the route, once known
    pub origin: String,
    /// Name of the last stop on the route, once known
    pub destination: String,
    pub driver: String,
    pub capacity: u32,
    pub occupancy: u32,
    pub status: VehicleStatus,
    /// [latitude, longitude]; set from the first accepted ping
    pub current_location: Option<[f64; 2]>,
    /// Route polyline as [lat, lon] waypoints; empty until the route resolves
    pub route: Vec<[f64; 2]>,
    pub stops: Vec<StopState>,
    /// Timestamp of the most recent accepted ping (epoch ms)
    pub last_ping_at: Option<i64>,
    /// Arrival notifications recorded so far, keyed by stop id. The value is
    /// the confirmed departure time when one is known. A route that resolves
    /// after pings reported arrivals is seeded from this record, so both
    /// event orders converge to the same stop completion state.
    #[serde(skip)]
    pub arrivals: HashMap<String, Option<i64>>,
}

impl VehicleState {
    /// Skeleton created on first sighting; route and stops attach later.
    pub fn new(id: &str, location: [f64; 2], timestamp: i64) -> Self {
        Self {
            id: id.to_string(),
            display_name: format!("Bus {id}"),
            origin: PLACEHOLDER.to_string(),
            destination: PLACEHOLDER.to_string(),
            driver: PLACEHOLDER.to_string(),
            capacity: DEFAULT_CAPACITY,
            occupancy: 0,
            status: VehicleStatus::Active,
            current_location: Some(location),
            route: Vec::new(),
            stops: Vec::new(),
            last_ping_at: Some(timestamp),
            arrivals: HashMap::new(),
        }
    }
}

/// Canonical vehicle mapping. Written only by the reconciler task; everyone
/// else holds read guards on whole-state snapshots.
pub type VehicleStore = Arc<RwLock<HashMap<String, Arc<VehicleState>>>>;

/// Notification that a merge was committed for a vehicle
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotUpdate {
    pub vehicle_id: String,
    /// When this update was committed (RFC 3339)
    pub timestamp: String,
}

/// Sender for snapshot update notifications
pub type SnapshotSender = broadcast::Sender<SnapshotUpdate>;

/// Raw position ping from the GPS feed
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingMessage {
    pub bus_id: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    /// Epoch milliseconds
    pub timestamp: i64,
    #[serde(default)]
    pub arrived_stops: Vec<String>,
    /// Fallback departure times; the prediction feed takes precedence
    #[serde(default)]
    pub arrival_times: HashMap<String, i64>,
    pub occupancy: Option<u32>,
}

/// Confirmed arrival frame from the prediction feed
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrivalFrame {
    pub bus_id: String,
    pub arrived_stops: Vec<String>,
    #[serde(default)]
    pub arrival_times: HashMap<String, i64>,
}

/// Forward ETA estimates from the prediction feed
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimateFrame {
    pub bus_id: String,
    pub eta_per_stop: HashMap<String, i64>,
}

/// A message on the prediction feed, discriminated by which keys it carries.
/// Frames carrying neither `arrivedStops` nor `etaPerStop` fail to parse and
/// are dropped by the forwarder.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PredictionFrame {
    Arrival(ArrivalFrame),
    Estimate(EstimateFrame),
}

impl PredictionFrame {
    pub fn vehicle_id(&self) -> &str {
        match self {
            PredictionFrame::Arrival(frame) => &frame.bus_id,
            PredictionFrame::Estimate(frame) => &frame.bus_id,
        }
    }
}
