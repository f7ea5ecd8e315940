use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A named path with polyline geometry and ordered stops.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Route {
    pub route_id: String,
    pub name: String,
    /// Ordered sequence of [lng, lat] points; at least two.
    pub polyline: Vec<[f64; 2]>,
    /// Stops in travel order.
    pub stops: Vec<Stop>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Stop {
    pub stop_id: String,
    pub name: String,
    pub lng: f64,
    pub lat: f64,
    /// Scheduled minutes from route start, where known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_offset_minutes: Option<u32>,
}
