use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    Scheduled,
    Active,
    Completed,
    Cancelled,
}

impl AssignmentStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "active" => AssignmentStatus::Active,
            "completed" => AssignmentStatus::Completed,
            "cancelled" => AssignmentStatus::Cancelled,
            _ => AssignmentStatus::Scheduled,
        }
    }
}

/// Time-bounded binding of a driver to a bus and route. Written by the
/// dispatch tooling; the tracking core only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Assignment {
    pub assignment_id: String,
    pub driver_id: String,
    pub bus_id: String,
    pub route_id: String,
    pub shift_start: DateTime<Utc>,
    pub shift_end: DateTime<Utc>,
    pub status: AssignmentStatus,
    pub active: bool,
}
