mod api;
mod auth;
mod config;
mod error;
mod fanout;
mod geo;
mod models;
mod protocol;
mod store;
mod subscriptions;
mod throttle;
mod workers;

use std::sync::Arc;

use axum::Router;
use sqlx::sqlite::SqlitePool;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use api::AppState;
use auth::JwtConfig;
use config::Config;
use fanout::Broadcaster;
use store::BusStore;
use subscriptions::SubscriptionRegistry;
use throttle::ThrottleRegistry;
use workers::eta::EtaWorker;

#[derive(OpenApi)]
#[openapi(
    info(title = "Bus Live Tracking API", version = "0.1.0"),
    paths(
        api::buses::near,
        api::buses::get_bus,
        api::buses::list_buses,
        api::routes::get_route,
        api::health::health_check,
    ),
    components(schemas(
        api::ErrorResponse,
        api::buses::NearBus,
        api::buses::NearResponse,
        api::buses::BusListResponse,
        api::health::HealthResponse,
        models::BusSnapshot,
        models::BusStatus,
        models::GeoPoint,
        models::LastSeen,
        models::LastSeenStatus,
        models::Route,
        models::Stop,
        protocol::NextStop,
    )),
    tags(
        (name = "buses", description = "Live bus state and geospatial queries"),
        (name = "routes", description = "Route geometry and stops"),
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
                .unwrap_or_else(|_| "info,tower_http=info,sqlx=warn".into()),
        )
        .init();

    // Load config
    let config = Config::load("config.yaml").expect("Failed to load config");
    config.validate();

    let jwt = JwtConfig::try_from_env("JWT_SECRET").expect("Invalid JWT configuration");

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

    // Initialize SQLite database
    if let Some(parent) = std::path::Path::new(&config.database_path).parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!("Could not create database directory: {}", e);
        }
    }
    let db_url = format!("sqlite:{}?mode=rwc", config.database_path);
    let pool = SqlitePool::connect(&db_url)
        .await
        .expect("Failed to connect to SQLite database");

    // Run migrations
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    tracing::info!("Database migrations completed");

    // Shared tracking state
    let store = Arc::new(BusStore::new(pool));
    let registry = Arc::new(SubscriptionRegistry::new());
    let throttle = Arc::new(ThrottleRegistry::new(config.throttle));
    let broadcaster = Broadcaster::new(store.clone(), registry.clone());

    // Cooperative shutdown for the background loops.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(broadcaster.clone().run(shutdown_rx.clone()));

    if config.workers.enabled {
        tokio::spawn(workers::stale::run(
            store.clone(),
            config.stale,
            shutdown_rx.clone(),
        ));
        let eta_worker = EtaWorker::new(store.clone(), broadcaster.clone(), config.eta);
        tokio::spawn(eta_worker.run(shutdown_rx.clone()));
        tracing::info!("staleness and eta workers running on this instance");
    } else {
        tracing::info!("workers disabled by config, another instance runs them");
    }

    let config = Arc::new(config);
    let state = AppState {
        store,
        registry,
        throttle,
        jwt: Arc::new(jwt),
        config: config.clone(),
    };

    // Build the app
    let app = Router::new()
        .merge(api::router(state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind listener");

    tracing::info!(addr = %config.bind_addr, "Server running");
    tracing::info!("Swagger UI: /swagger-ui");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await
        .expect("Failed to start server");
}
