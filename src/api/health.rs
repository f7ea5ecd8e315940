use axum::{extract::State, Json};
use serde::Serialize;
use utoipa::ToSchema;

use super::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Whether the service is running.
    pub healthy: bool,
    /// Whether the bus store answered the probe query.
    pub store_reachable: bool,
    /// Number of bus records, when the store is reachable.
    pub bus_count: Option<i64>,
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service health status", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let (store_reachable, bus_count) = match state.store.count_buses().await {
        Ok(count) => (true, Some(count)),
        Err(_) => (false, None),
    };

    Json(HealthResponse {
        healthy: true,
        store_reachable,
        bus_count,
    })
}
