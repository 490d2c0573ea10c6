pub mod api;
mod config;
mod providers;
mod sync;

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use config::Config;
use sync::SyncManager;

#[derive(OpenApi)]
#[openapi(
    info(title = "Bus Tracking API", version = "0.1.0"),
    paths(
        api::vehicles::list_vehicles,
        api::vehicles::get_vehicle,
        api::vehicles::get_vehicle_stops,
        api::health_check,
    ),
    components(schemas(
        api::ErrorResponse,
        api::HealthResponse,
        api::vehicles::VehicleSummary,
        api::vehicles::VehicleListResponse,
        api::vehicles::StopRow,
        api::vehicles::VehicleStopsResponse,
        sync::VehicleState,
        sync::VehicleStatus,
        sync::StopState,
    )),
    tags(
        (name = "vehicles", description = "Live vehicle tracking"),
        (name = "health", description = "Service health check")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .init();

    // Load config
    let config = Config::load("config.yaml").expect("Failed to load config");
    tracing::info!(
        gps = %config.gps_ws_url,
        eta = %config.eta_ws_url,
        routes = %config.route_base_url,
        "Loaded configuration"
    );

    // Build CORS layer based on config
    let cors_layer = if config.cors_permissive {
        tracing::warn!("CORS: Permissive mode explicitly enabled (all origins allowed) - DO NOT USE IN PRODUCTION");
        CorsLayer::permissive()
    } else if !config.cors_origins.is_empty() {
        tracing::info!(origins = ?config.cors_origins, "CORS: Restricting to configured origins");
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([axum::http::Method::GET, axum::http::Method::OPTIONS])
            .allow_headers([axum::http::header::CONTENT_TYPE])
    } else {
        panic!("CORS configuration error: Either set 'cors_origins' with allowed origins, or set 'cors_permissive: true' for development");
    };

    let listen_addr = config.listen_addr.clone();

    // Start sync engine in background
    let sync_manager =
        Arc::new(SyncManager::new(config).expect("Failed to initialize sync engine"));
    let store = sync_manager.vehicle_store();
    let updates_tx = sync_manager.updates_sender();
    let engine = sync_manager.clone();
    tokio::spawn(async move {
        engine.start().await;
    });

    // Build the app
    let app = Router::new()
        .route("/", get(root))
        .nest("/api", api::router(store, updates_tx))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer);

    // Start server
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {}: {}", listen_addr, e));

    tracing::info!("Server running on http://{}", listen_addr);
    tracing::info!("Swagger UI: http://{}/swagger-ui", listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(sync_manager))
        .await
        .expect("Failed to start server");
}

async fn shutdown_signal(sync_manager: Arc<SyncManager>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutting down");
    sync_manager.shutdown().await;
}

async fn root() -> &'static str {
    "Bus Tracking API"
}
