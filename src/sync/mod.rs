//! Live state synchronization of the vehicle fleet.
//!
//! This module handles:
//! - Consuming the GPS position feed and the arrival/ETA prediction feed
//! - One-time route resolution per vehicle (geometry + stop list)
//! - Merging everything into the canonical vehicle mapping and notifying
//!   snapshot observers after every committed change
//!
//! All merges run on a single reconciler task, so no two merges ever race.
//! Each merge produces a fresh [`VehicleState`] that replaces the previous
//! one wholesale; readers holding an `Arc` to the old state keep a
//! consistent view.

mod types;

pub use types::{
    ArrivalFrame, EstimateFrame, PingMessage, PredictionFrame, SnapshotSender, SnapshotUpdate,
    StopState, VehicleState, VehicleStatus, VehicleStore,
};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use geo::{Distance, Haversine, Point};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::providers::feed::{self, FeedConfig, FeedHandle};
use crate::providers::routes::{RouteClient, RouteData, RouteError};

/// Capacity of the reconciler event queue
const EVENT_BUFFER: usize = 256;

/// Capacity of the snapshot update broadcast. Observers that lag simply
/// re-read the latest state from the store.
const UPDATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Route client error: {0}")]
    RouteClient(String),
}

/// One unit of work for the reconciler task
enum SyncEvent {
    Ping(PingMessage),
    Prediction(PredictionFrame),
    RouteLoaded {
        vehicle_id: String,
        result: Result<RouteData, RouteError>,
    },
}

/// Owns the canonical vehicle mapping and the feed connections
pub struct SyncManager {
    config: Config,
    route_client: RouteClient,
    vehicles: VehicleStore,
    updates_tx: SnapshotSender,
    feeds: Mutex<Vec<FeedHandle>>,
}

impl SyncManager {
    pub fn new(config: Config) -> Result<Self, SyncError> {
        let route_client = RouteClient::new(&config.route_base_url, config.route_aliases.clone())
            .map_err(|e| SyncError::RouteClient(e.to_string()))?;

        let (updates_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            route_client,
            vehicles: Arc::new(RwLock::new(HashMap::new())),
            updates_tx,
            feeds: Mutex::new(Vec::new()),
        })
    }

    /// Get a reference to the vehicle store for API access
    pub fn vehicle_store(&self) -> VehicleStore {
        self.vehicles.clone()
    }

    /// Get the snapshot update sender for passing to API handlers
    pub fn updates_sender(&self) -> SnapshotSender {
        self.updates_tx.clone()
    }

    /// Open both feeds and run the reconciler loop. Runs until the feeds
    /// are closed via [`SyncManager::shutdown`].
    pub async fn start(self: Arc<Self>) {
        info!("Starting sync engine");

        let base_delay = Duration::from_millis(self.config.tracking.reconnect_base_ms);
        let max_delay = Duration::from_millis(self.config.tracking.reconnect_max_ms);

        let (gps_handle, gps_rx) = feed::open(FeedConfig {
            name: "gps".to_string(),
            url: self.config.gps_ws_url.clone(),
            base_delay,
            max_delay,
        });
        let (eta_handle, eta_rx) = feed::open(FeedConfig {
            name: "eta".to_string(),
            url: self.config.eta_ws_url.clone(),
            base_delay,
            max_delay,
        });
        {
            let mut feeds = self.feeds.lock().await;
            feeds.push(gps_handle);
            feeds.push(eta_handle);
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(forward_pings(gps_rx, events_tx.clone()));
        tokio::spawn(forward_predictions(eta_rx, events_tx.clone()));

        self.run(events_rx, events_tx).await;
    }

    /// Close all feed connections. Idempotent; in-flight merges drain and
    /// the reconciler loop then stops on its own.
    pub async fn shutdown(&self) {
        for handle in self.feeds.lock().await.iter() {
            handle.close();
        }
    }

    /// Reconciler loop: the single writer of the canonical mapping.
    async fn run(
        &self,
        mut events_rx: mpsc::Receiver<SyncEvent>,
        events_tx: mpsc::Sender<SyncEvent>,
    ) {
        // Vehicles whose route load was already triggered (or attempted)
        let mut route_requested: HashSet<String> = HashSet::new();

        while let Some(event) = events_rx.recv().await {
            match event {
                SyncEvent::Ping(ping) => {
                    self.handle_ping(ping, &mut route_requested, &events_tx).await;
                }
                SyncEvent::Prediction(frame) => self.handle_prediction(frame).await,
                SyncEvent::RouteLoaded { vehicle_id, result } => {
                    self.handle_route_loaded(vehicle_id, result).await;
                }
            }
        }

        info!("Sync engine stopped");
    }

    async fn handle_ping(
        &self,
        ping: PingMessage,
        route_requested: &mut HashSet<String>,
        events_tx: &mpsc::Sender<SyncEvent>,
    ) {
        let (lat, lon) = match (ping.lat, ping.lon) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => (lat, lon),
            _ => {
                warn!(vehicle = %ping.bus_id, "Dropping ping without finite coordinates");
                return;
            }
        };

        let existing = self.vehicles.read().await.get(&ping.bus_id).cloned();
        if let Some(next) = apply_ping(
            existing.as_deref(),
            &ping,
            lat,
            lon,
            self.config.tracking.jitter_meters,
        ) {
            self.commit(next).await;
        }

        // First sighting triggers exactly one route load, off the ping path
        if route_requested.insert(ping.bus_id.clone()) {
            let client = self.route_client.clone();
            let events_tx = events_tx.clone();
            let vehicle_id = ping.bus_id.clone();
            tokio::spawn(async move {
                let result = client.load(&vehicle_id).await;
                let _ = events_tx
                    .send(SyncEvent::RouteLoaded { vehicle_id, result })
                    .await;
            });
        }
    }

    async fn handle_prediction(&self, frame: PredictionFrame) {
        let existing = self.vehicles.read().await.get(frame.vehicle_id()).cloned();
        let Some(existing) = existing else {
            debug!(vehicle = %frame.vehicle_id(), "Prediction frame for unknown vehicle, ignoring");
            return;
        };

        let next = match &frame {
            PredictionFrame::Arrival(arrival) => apply_arrival(&existing, arrival),
            PredictionFrame::Estimate(estimate) => apply_estimate(&existing, estimate),
        };
        if let Some(next) = next {
            self.commit(next).await;
        }
    }

    async fn handle_route_loaded(
        &self,
        vehicle_id: String,
        result: Result<RouteData, RouteError>,
    ) {
        let data = match result {
            Ok(data) => data,
            Err(e) => {
                // Recoverable degradation: the vehicle keeps operating with
                // live coordinates and an empty route. Not retried.
                warn!(vehicle = %vehicle_id, error = %e, "Route unavailable");
                return;
            }
        };

        let existing = self.vehicles.read().await.get(&vehicle_id).cloned();
        let Some(existing) = existing else {
            return;
        };

        if let Some(next) = apply_route(&existing, &data) {
            info!(
                vehicle = %vehicle_id,
                waypoints = next.route.len(),
                stops = next.stops.len(),
                "Route resolved"
            );
            self.commit(next).await;
        }
    }

    /// Replace the vehicle's snapshot and notify observers.
    async fn commit(&self, state: VehicleState) {
        let vehicle_id = state.id.clone();
        self.vehicles
            .write()
            .await
            .insert(vehicle_id.clone(), Arc::new(state));

        // Ignore send errors - they just mean no one is listening
        let _ = self.updates_tx.send(SnapshotUpdate {
            vehicle_id,
            timestamp: Utc::now().to_rfc3339(),
        });
    }
}

async fn forward_pings(
    mut rx: mpsc::Receiver<serde_json::Value>,
    tx: mpsc::Sender<SyncEvent>,
) {
    while let Some(raw) = rx.recv().await {
        match serde_json::from_value::<PingMessage>(raw) {
            Ok(ping) => {
                if tx.send(SyncEvent::Ping(ping)).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!(error = %e, "Dropping malformed position ping"),
        }
    }
}

async fn forward_predictions(
    mut rx: mpsc::Receiver<serde_json::Value>,
    tx: mpsc::Sender<SyncEvent>,
) {
    while let Some(raw) = rx.recv().await {
        match serde_json::from_value::<PredictionFrame>(raw) {
            Ok(frame) => {
                if tx.send(SyncEvent::Prediction(frame)).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!(error = %e, "Dropping malformed prediction frame"),
        }
    }
}

/// Great-circle distance in meters between two [lat, lon] pairs
fn distance_meters(a: [f64; 2], b: [f64; 2]) -> f64 {
    Haversine.distance(Point::new(a[1], a[0]), Point::new(b[1], b[0]))
}

/// Merge a position ping. Coordinates below the jitter threshold are
/// discarded, but occupancy and arrival notifications in the same ping
/// still apply. Returns None when nothing changed.
fn apply_ping(
    existing: Option<&VehicleState>,
    ping: &PingMessage,
    lat: f64,
    lon: f64,
    jitter_meters: f64,
) -> Option<VehicleState> {
    let mut state = match existing {
        Some(current) => current.clone(),
        None => VehicleState::new(&ping.bus_id, [lat, lon], ping.timestamp),
    };

    match (existing, state.current_location) {
        (Some(_), Some(previous)) => {
            if distance_meters(previous, [lat, lon]) >= jitter_meters {
                state.current_location = Some([lat, lon]);
            }
        }
        _ => state.current_location = Some([lat, lon]),
    }

    state.last_ping_at = Some(ping.timestamp);
    if let Some(occupancy) = ping.occupancy {
        state.occupancy = occupancy;
    }

    for stop_id in &ping.arrived_stops {
        let recorded = state.arrivals.entry(stop_id.clone()).or_insert(None);
        // Ping-supplied departure times are a fallback only; they never
        // overwrite a time the prediction feed already confirmed.
        if recorded.is_none() {
            *recorded = ping.arrival_times.get(stop_id).copied();
        }
    }
    sync_stops(&mut state);

    match existing {
        Some(current) if *current == state => None,
        _ => Some(state),
    }
}

/// Attach resolved route geometry and stops. A vehicle whose stops are
/// already populated is left untouched, which guards against overlapping
/// load triggers double-merging.
fn apply_route(existing: &VehicleState, data: &RouteData) -> Option<VehicleState> {
    if !existing.stops.is_empty() {
        return None;
    }

    let mut state = existing.clone();
    state.route = data.waypoints.clone();
    state.stops = data
        .stops
        .iter()
        .map(|stop| StopState {
            id: stop.stop_id.clone(),
            name: stop.name.clone(),
            coordinates: [stop.lat, stop.lon],
            completed: false,
            departure_time: None,
            estimated_time: None,
        })
        .collect();

    if let Some(first) = data.stops.first() {
        state.origin = first.name.clone();
    }
    if let Some(last) = data.stops.last() {
        state.destination = last.name.clone();
    }

    // Seed completion state from arrivals that were reported before the
    // route resolved, so sight order of events does not matter.
    sync_stops(&mut state);
    Some(state)
}

/// Merge a confirmed arrival frame. The prediction feed is authoritative
/// for departure times and overwrites any ping-supplied fallback.
fn apply_arrival(existing: &VehicleState, frame: &ArrivalFrame) -> Option<VehicleState> {
    let mut state = existing.clone();

    for stop_id in &frame.arrived_stops {
        let recorded = state.arrivals.entry(stop_id.clone()).or_insert(None);
        if let Some(time) = frame.arrival_times.get(stop_id) {
            *recorded = Some(*time);
        }
    }
    sync_stops(&mut state);

    (state != *existing).then_some(state)
}

/// Merge an ETA estimate frame. Entries for completed stops and entries
/// with a zero value are ignored.
fn apply_estimate(existing: &VehicleState, frame: &EstimateFrame) -> Option<VehicleState> {
    let mut state = existing.clone();

    for stop in &mut state.stops {
        if stop.completed {
            continue;
        }
        if let Some(&eta) = frame.eta_per_stop.get(&stop.id) {
            if eta != 0 {
                stop.estimated_time = Some(eta);
            }
        }
    }

    (state != *existing).then_some(state)
}

/// Mirror the recorded arrival notifications onto loaded stop entries.
/// Running this after every merge is what makes ping, route and frame
/// ordering commute: `completed` only ever moves to true and the recorded
/// departure time carries the feed-precedence rules with it.
fn sync_stops(state: &mut VehicleState) {
    let VehicleState { stops, arrivals, .. } = state;
    for stop in stops.iter_mut() {
        if let Some(recorded) = arrivals.get(&stop.id) {
            stop.completed = true;
            stop.estimated_time = None;
            if recorded.is_some() {
                stop.departure_time = *recorded;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping(bus_id: &str, lat: f64, lon: f64, timestamp: i64) -> PingMessage {
        PingMessage {
            bus_id: bus_id.to_string(),
            lat: Some(lat),
            lon: Some(lon),
            timestamp,
            arrived_stops: Vec::new(),
            arrival_times: HashMap::new(),
            occupancy: None,
        }
    }

    fn merge_ping(
        existing: Option<&VehicleState>,
        ping: &PingMessage,
        jitter_meters: f64,
    ) -> Option<VehicleState> {
        apply_ping(
            existing,
            ping,
            ping.lat.unwrap(),
            ping.lon.unwrap(),
            jitter_meters,
        )
    }

    fn route_with_stops(stop_ids: &[&str]) -> RouteData {
        RouteData {
            waypoints: vec![[10.0, 20.0], [10.1, 20.1]],
            stops: stop_ids
                .iter()
                .enumerate()
                .map(|(i, id)| crate::providers::routes::RouteStop {
                    stop_id: id.to_string(),
                    name: format!("Stop {}", i + 1),
                    lat: 10.0 + i as f64 * 0.1,
                    lon: 20.0 + i as f64 * 0.1,
                })
                .collect(),
        }
    }

    fn arrival_frame(bus_id: &str, stops: &[(&str, i64)]) -> ArrivalFrame {
        ArrivalFrame {
            bus_id: bus_id.to_string(),
            arrived_stops: stops.iter().map(|(id, _)| id.to_string()).collect(),
            arrival_times: stops
                .iter()
                .map(|(id, time)| (id.to_string(), *time))
                .collect(),
        }
    }

    #[test]
    fn first_ping_creates_vehicle_with_defaults() {
        let msg = ping("B1", 10.0, 20.0, 1000);
        let state = merge_ping(None, &msg, 15.0).expect("new vehicle committed");

        assert_eq!(state.id, "B1");
        assert_eq!(state.display_name, "Bus B1");
        assert_eq!(state.status, VehicleStatus::Active);
        assert_eq!(state.current_location, Some([10.0, 20.0]));
        assert_eq!(state.occupancy, 0);
        assert_eq!(state.capacity, 50);
        assert!(state.route.is_empty());
        assert!(state.stops.is_empty());
        assert_eq!(state.last_ping_at, Some(1000));
    }

    #[test]
    fn ping_below_jitter_threshold_freezes_position_but_updates_last_ping() {
        let state = merge_ping(None, &ping("B1", 10.0, 20.0, 1000), 15.0).unwrap();

        // ~1.5 m jump, well below the 15 m threshold
        let next = merge_ping(Some(&state), &ping("B1", 10.00001, 20.00001, 1001), 15.0)
            .expect("last_ping_at still changes");
        assert_eq!(next.current_location, Some([10.0, 20.0]));
        assert_eq!(next.last_ping_at, Some(1001));
    }

    #[test]
    fn ping_above_jitter_threshold_moves_position() {
        let state = merge_ping(None, &ping("B1", 10.0, 20.0, 1000), 15.0).unwrap();

        // ~110 m jump
        let next = merge_ping(Some(&state), &ping("B1", 10.001, 20.0, 1001), 15.0).unwrap();
        assert_eq!(next.current_location, Some([10.001, 20.0]));
    }

    #[test]
    fn jittery_ping_still_applies_occupancy_and_arrivals() {
        let state = merge_ping(None, &ping("B1", 10.0, 20.0, 1000), 15.0).unwrap();
        let state = apply_route(&state, &route_with_stops(&["S1", "S2"])).unwrap();

        let mut msg = ping("B1", 10.00001, 20.00001, 1001);
        msg.occupancy = Some(12);
        msg.arrived_stops = vec!["S1".to_string()];

        let next = merge_ping(Some(&state), &msg, 15.0).unwrap();
        assert_eq!(next.current_location, Some([10.0, 20.0]), "position frozen");
        assert_eq!(next.occupancy, 12);
        assert!(next.stops[0].completed);
        assert!(!next.stops[1].completed);
    }

    #[test]
    fn repeated_identical_jitter_pings_converge_to_no_change() {
        let state = merge_ping(None, &ping("B1", 10.0, 20.0, 1000), 15.0).unwrap();
        let state = merge_ping(Some(&state), &ping("B1", 10.00001, 20.0, 1001), 15.0).unwrap();

        // Same timestamp and no payload difference: merge reports no change
        assert!(merge_ping(Some(&state), &ping("B1", 10.00001, 20.0, 1001), 15.0).is_none());
    }

    #[test]
    fn non_finite_coordinates_never_reach_apply_ping() {
        // The reconciler drops these before merging; the merge itself only
        // ever sees finite values. Covered here via the wire type.
        let msg: PingMessage = serde_json::from_str(
            r#"{"busId":"B1","lat":null,"lon":20.0,"timestamp":1,"arrivedStops":[]}"#,
        )
        .unwrap();
        assert!(msg.lat.is_none());
    }

    #[test]
    fn route_merge_populates_stops_and_endpoints_once() {
        let state = merge_ping(None, &ping("B1", 10.0, 20.0, 1000), 15.0).unwrap();
        let state = apply_route(&state, &route_with_stops(&["S1", "S2", "S3"])).unwrap();

        assert_eq!(state.stops.len(), 3);
        assert_eq!(state.origin, "Stop 1");
        assert_eq!(state.destination, "Stop 3");
        assert_eq!(state.route.len(), 2);

        // Second resolution is a no-op while stops are populated
        assert!(apply_route(&state, &route_with_stops(&["S9"])).is_none());
    }

    #[test]
    fn route_load_and_arrival_ping_commute() {
        let mut arrived = ping("B1", 10.0, 20.0, 1000);
        arrived.arrived_stops = vec!["S1".to_string()];
        let route = route_with_stops(&["S1", "S2"]);

        // ping (with arrival) then route
        let a = merge_ping(None, &arrived, 15.0).unwrap();
        let a = apply_route(&a, &route).unwrap();

        // route then ping (with arrival)
        let b = merge_ping(None, &ping("B1", 10.0, 20.0, 999), 15.0).unwrap();
        let b = apply_route(&b, &route).unwrap();
        let b = merge_ping(Some(&b), &arrived, 15.0).unwrap();

        assert_eq!(a.stops, b.stops);
        assert!(a.stops[0].completed);
        assert!(!a.stops[1].completed);
    }

    #[test]
    fn arrival_frame_is_idempotent() {
        let state = merge_ping(None, &ping("B1", 10.0, 20.0, 1000), 15.0).unwrap();
        let state = apply_route(&state, &route_with_stops(&["S1", "S2"])).unwrap();

        let frame = arrival_frame("B1", &[("S1", 2500)]);
        let once = apply_arrival(&state, &frame).unwrap();
        assert!(apply_arrival(&once, &frame).is_none(), "second apply is a no-op");

        assert!(once.stops[0].completed);
        assert_eq!(once.stops[0].departure_time, Some(2500));
        assert_eq!(once.stops[0].estimated_time, None);
    }

    #[test]
    fn completed_never_reverts() {
        let state = merge_ping(None, &ping("B1", 10.0, 20.0, 1000), 15.0).unwrap();
        let state = apply_route(&state, &route_with_stops(&["S1", "S2"])).unwrap();
        let state = apply_arrival(&state, &arrival_frame("B1", &[("S1", 2500)])).unwrap();

        // A later estimate for the completed stop is ignored
        let estimate = EstimateFrame {
            bus_id: "B1".to_string(),
            eta_per_stop: HashMap::from([("S1".to_string(), 9999)]),
        };
        assert!(apply_estimate(&state, &estimate).is_none());

        // A plain ping naming the stop again changes nothing either
        let mut msg = ping("B1", 10.001, 20.0, 2000);
        msg.arrived_stops = vec!["S1".to_string()];
        let next = merge_ping(Some(&state), &msg, 15.0).unwrap();
        assert!(next.stops[0].completed);
        assert_eq!(next.stops[0].departure_time, Some(2500));
    }

    #[test]
    fn estimate_then_arrival_clears_estimate_and_sets_departure() {
        let state = merge_ping(None, &ping("B1", 10.0, 20.0, 1000), 15.0).unwrap();
        let state = apply_route(&state, &route_with_stops(&["S1", "S2"])).unwrap();

        let estimate = EstimateFrame {
            bus_id: "B1".to_string(),
            eta_per_stop: HashMap::from([("S2".to_string(), 2000)]),
        };
        let state = apply_estimate(&state, &estimate).unwrap();
        assert_eq!(state.stops[1].estimated_time, Some(2000));

        let state = apply_arrival(&state, &arrival_frame("B1", &[("S2", 2500)])).unwrap();
        assert!(state.stops[1].completed);
        assert_eq!(state.stops[1].departure_time, Some(2500));
        assert_eq!(state.stops[1].estimated_time, None);
    }

    #[test]
    fn zero_valued_estimates_are_skipped() {
        let state = merge_ping(None, &ping("B1", 10.0, 20.0, 1000), 15.0).unwrap();
        let state = apply_route(&state, &route_with_stops(&["S1"])).unwrap();

        let estimate = EstimateFrame {
            bus_id: "B1".to_string(),
            eta_per_stop: HashMap::from([("S1".to_string(), 0)]),
        };
        assert!(apply_estimate(&state, &estimate).is_none());
    }

    #[test]
    fn prediction_feed_departure_time_wins_over_ping_fallback() {
        let route = route_with_stops(&["S1"]);
        let base = merge_ping(None, &ping("B1", 10.0, 20.0, 1000), 15.0).unwrap();
        let base = apply_route(&base, &route).unwrap();

        let mut with_times = ping("B1", 10.001, 20.0, 1001);
        with_times.arrived_stops = vec!["S1".to_string()];
        with_times.arrival_times = HashMap::from([("S1".to_string(), 2400)]);
        let frame = arrival_frame("B1", &[("S1", 2500)]);

        // ping fallback first, frame overwrites
        let a = merge_ping(Some(&base), &with_times, 15.0).unwrap();
        assert_eq!(a.stops[0].departure_time, Some(2400));
        let a = apply_arrival(&a, &frame).unwrap();
        assert_eq!(a.stops[0].departure_time, Some(2500));

        // frame first, ping fallback is ignored
        let b = apply_arrival(&base, &frame).unwrap();
        let b = merge_ping(Some(&b), &with_times, 15.0).unwrap();
        assert_eq!(b.stops[0].departure_time, Some(2500));
    }

    #[test]
    fn arrivals_recorded_before_route_seed_departure_times() {
        // Arrival frame lands while the route is still loading
        let state = merge_ping(None, &ping("B1", 10.0, 20.0, 1000), 15.0).unwrap();
        let state = apply_arrival(&state, &arrival_frame("B1", &[("S1", 2500)])).unwrap();
        assert!(state.stops.is_empty(), "no stops yet");

        let state = apply_route(&state, &route_with_stops(&["S1", "S2"])).unwrap();
        assert!(state.stops[0].completed);
        assert_eq!(state.stops[0].departure_time, Some(2500));
        assert!(!state.stops[1].completed);
    }
}
