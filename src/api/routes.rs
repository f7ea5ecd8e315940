use axum::{
    extract::{Path, State},
    Json,
};

use super::{ApiError, AppState};
use crate::models::Route;

/// Route geometry and stops, for drawing the line client-side.
#[utoipa::path(
    get,
    path = "/routes/{route_id}",
    params(("route_id" = String, Path, description = "Route identifier")),
    responses(
        (status = 200, description = "Route with polyline and ordered stops", body = Route),
        (status = 404, description = "Unknown route", body = super::ErrorResponse)
    ),
    tag = "routes"
)]
pub async fn get_route(
    State(state): State<AppState>,
    Path(route_id): Path<String>,
) -> Result<Json<Route>, ApiError> {
    let route = state.store.get_route(&route_id).await?;
    route
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no route with id {}", route_id)))
}
