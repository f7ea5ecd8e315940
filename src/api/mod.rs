pub mod buses;
pub mod error;
pub mod health;
pub mod routes;
pub mod ws;

pub use error::{ApiError, ErrorResponse};

use axum::{routing::get, Router};
use std::sync::Arc;

use crate::auth::JwtConfig;
use crate::config::Config;
use crate::store::BusStore;
use crate::subscriptions::SubscriptionRegistry;
use crate::throttle::ThrottleRegistry;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<BusStore>,
    pub registry: Arc<SubscriptionRegistry>,
    pub throttle: Arc<ThrottleRegistry>,
    pub jwt: Arc<JwtConfig>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/buses/near", get(buses::near))
        .route("/buses/{bus_id}", get(buses::get_bus))
        .route("/buses", get(buses::list_buses))
        .route("/routes/{route_id}", get(routes::get_route))
        .route("/health", get(health::health_check))
        .route("/ws/driver", get(ws::driver_ws))
        .route("/ws/passenger", get(ws::passenger_ws))
        .with_state(state)
}
