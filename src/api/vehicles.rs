use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::api::ErrorResponse;
use crate::sync::{VehicleState, VehicleStatus, VehicleStore};

#[derive(Debug, Serialize, ToSchema)]
pub struct VehicleSummary {
    pub id: String,
    pub display_name: String,
    pub status: VehicleStatus,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VehicleListResponse {
    pub vehicles: Vec<VehicleSummary>,
    pub count: usize,
}

/// One row of the per-vehicle stop table
#[derive(Debug, Serialize, ToSchema)]
pub struct StopRow {
    pub stop_id: String,
    pub stop_name: String,
    /// Confirmed departure from this stop (epoch ms), once the stop completed
    pub actual_arrival: Option<i64>,
    /// Live ETA prediction (epoch ms); null once the stop completed
    pub eta: Option<i64>,
    pub completed: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VehicleStopsResponse {
    pub vehicle_id: String,
    pub stops: Vec<StopRow>,
}

fn not_found(id: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("Vehicle {} not found", id),
        }),
    )
}

/// List all currently tracked vehicles
#[utoipa::path(
    get,
    path = "/api/vehicles",
    responses(
        (status = 200, description = "All tracked vehicles", body = VehicleListResponse)
    ),
    tag = "vehicles"
)]
pub async fn list_vehicles(State(store): State<VehicleStore>) -> Json<VehicleListResponse> {
    let store = store.read().await;
    let mut vehicles: Vec<VehicleSummary> = store
        .values()
        .map(|state| VehicleSummary {
            id: state.id.clone(),
            display_name: state.display_name.clone(),
            status: state.status,
        })
        .collect();
    // Stable ordering for clients that diff successive responses
    vehicles.sort_by(|a, b| a.id.cmp(&b.id));

    let count = vehicles.len();
    Json(VehicleListResponse { vehicles, count })
}

/// Get the full snapshot of one vehicle
#[utoipa::path(
    get,
    path = "/api/vehicles/{id}",
    params(
        ("id" = String, Path, description = "Vehicle identifier")
    ),
    responses(
        (status = 200, description = "Vehicle snapshot", body = VehicleState),
        (status = 404, description = "Vehicle not tracked", body = ErrorResponse)
    ),
    tag = "vehicles"
)]
pub async fn get_vehicle(
    State(store): State<VehicleStore>,
    Path(id): Path<String>,
) -> Result<Json<VehicleState>, (StatusCode, Json<ErrorResponse>)> {
    let store = store.read().await;
    let vehicle = store.get(&id).ok_or_else(|| not_found(&id))?;
    Ok(Json(vehicle.as_ref().clone()))
}

/// Get the stop table for one vehicle
#[utoipa::path(
    get,
    path = "/api/vehicles/{id}/stops",
    params(
        ("id" = String, Path, description = "Vehicle identifier")
    ),
    responses(
        (status = 200, description = "Stop progress for the vehicle", body = VehicleStopsResponse),
        (status = 404, description = "Vehicle not tracked", body = ErrorResponse)
    ),
    tag = "vehicles"
)]
pub async fn get_vehicle_stops(
    State(store): State<VehicleStore>,
    Path(id): Path<String>,
) -> Result<Json<VehicleStopsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let store = store.read().await;
    let vehicle = store.get(&id).ok_or_else(|| not_found(&id))?;
    Ok(Json(VehicleStopsResponse {
        vehicle_id: vehicle.id.clone(),
        stops: vehicle
            .stops
            .iter()
            .map(|stop| StopRow {
                stop_id: stop.id.clone(),
                stop_name: stop.name.clone(),
                actual_arrival: stop.departure_time,
                eta: stop.estimated_time,
                completed: stop.completed,
            })
            .collect(),
    }))
}

pub fn router(store: VehicleStore) -> Router {
    Router::new()
        .route("/", get(list_vehicles))
        .route("/{id}", get(get_vehicle))
        .route("/{id}/stops", get(get_vehicle_stops))
        .with_state(store)
}
