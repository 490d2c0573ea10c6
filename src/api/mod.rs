pub mod vehicles;
pub mod ws;

use axum::{routing::get, Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::sync::{SnapshotSender, VehicleStore};

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Whether the service is running
    pub healthy: bool,
    /// Number of vehicles currently tracked
    pub vehicle_count: usize,
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service health status", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health_check(
    axum::extract::State(store): axum::extract::State<VehicleStore>,
) -> Json<HealthResponse> {
    let vehicle_count = store.read().await.len();
    Json(HealthResponse {
        healthy: true,
        vehicle_count,
    })
}

pub fn router(store: VehicleStore, updates_tx: SnapshotSender) -> Router {
    let ws_state = ws::WsState {
        store: store.clone(),
        updates_tx,
    };

    Router::new()
        .nest("/vehicles", vehicles::router(store.clone()))
        .route("/health", get(health_check).with_state(store))
        .route("/ws/vehicles", get(ws::ws_vehicles).with_state(ws_state))
}
