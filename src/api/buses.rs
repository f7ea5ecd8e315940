use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use super::{ApiError, AppState};
use crate::error::TrackError;
use crate::geo;
use crate::models::{BusSnapshot, LastSeen};

/// Results of the nearby query are capped regardless of how wide the
/// radius is.
const NEAR_MAX_RESULTS: usize = 50;

/// Hard ceiling on list page size.
const LIST_LIMIT_CAP: i64 = 200;
const LIST_LIMIT_DEFAULT: i64 = 50;

#[derive(Debug, Deserialize, IntoParams)]
pub struct NearQuery {
    /// Centre longitude.
    pub lng: f64,
    /// Centre latitude.
    pub lat: f64,
    /// Radius in metres.
    pub r: f64,
}

/// One nearby bus, enriched with distance and recency.
#[derive(Debug, Serialize, ToSchema)]
pub struct NearBus {
    #[serde(flatten)]
    pub bus: BusSnapshot,
    /// Haversine distance from the query point, metres.
    pub distance_m: f64,
    pub last_seen: LastSeen,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct NearResponse {
    pub buses: Vec<NearBus>,
    pub timestamp: DateTime<Utc>,
}

/// Online buses within a radius of a point, closest first.
#[utoipa::path(
    get,
    path = "/buses/near",
    params(NearQuery),
    responses(
        (status = 200, description = "Online buses within the radius, ascending by distance", body = NearResponse),
        (status = 400, description = "Coordinates or radius out of range", body = super::ErrorResponse)
    ),
    tag = "buses"
)]
pub async fn near(
    State(state): State<AppState>,
    Query(query): Query<NearQuery>,
) -> Result<Json<NearResponse>, ApiError> {
    if !geo::valid_coord(query.lng, query.lat) {
        return Err(TrackError::BadRange("lng/lat out of range".to_string()).into());
    }
    let radius_max = state.config.near.radius_max_m;
    if !query.r.is_finite() || query.r <= 0.0 || query.r > radius_max {
        return Err(TrackError::BadRange(format!(
            "radius must be in (0, {}] metres",
            radius_max
        ))
        .into());
    }

    let now = Utc::now();
    let hits = state
        .store
        .nearby_online(query.lng, query.lat, query.r, NEAR_MAX_RESULTS)
        .await?;

    let buses = hits
        .into_iter()
        .map(|(bus, distance_m)| NearBus {
            last_seen: LastSeen::of(&bus, now),
            bus,
            distance_m,
        })
        .collect();

    Ok(Json(NearResponse {
        buses,
        timestamp: now,
    }))
}

/// Snapshot of a single bus.
#[utoipa::path(
    get,
    path = "/buses/{bus_id}",
    params(("bus_id" = String, Path, description = "Bus identifier")),
    responses(
        (status = 200, description = "Current bus snapshot", body = BusSnapshot),
        (status = 404, description = "Unknown bus", body = super::ErrorResponse)
    ),
    tag = "buses"
)]
pub async fn get_bus(
    State(state): State<AppState>,
    Path(bus_id): Path<String>,
) -> Result<Json<BusSnapshot>, ApiError> {
    let snapshot = state.store.get(&bus_id).await?;
    snapshot
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no bus with id {}", bus_id)))
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListQuery {
    /// Filter by online flag.
    pub online: Option<bool>,
    /// Filter by route.
    pub route_id: Option<String>,
    /// Page size, capped at 200.
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BusListResponse {
    pub buses: Vec<BusSnapshot>,
    pub timestamp: DateTime<Utc>,
}

/// Filtered bus listing.
#[utoipa::path(
    get,
    path = "/buses",
    params(ListQuery),
    responses(
        (status = 200, description = "Buses matching the filters", body = BusListResponse)
    ),
    tag = "buses"
)]
pub async fn list_buses(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<BusListResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(LIST_LIMIT_DEFAULT)
        .clamp(1, LIST_LIMIT_CAP);
    let buses = state
        .store
        .list(query.online, query.route_id.as_deref(), limit)
        .await?;
    Ok(Json(BusListResponse {
        buses,
        timestamp: Utc::now(),
    }))
}
