use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A (lng, lat) position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GeoPoint {
    pub lng: f64,
    pub lat: f64,
}

/// Operational status of a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum BusStatus {
    Idle,
    Moving,
    Stopped,
    Maintenance,
    Inactive,
}

impl BusStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusStatus::Idle => "idle",
            BusStatus::Moving => "moving",
            BusStatus::Stopped => "stopped",
            BusStatus::Maintenance => "maintenance",
            BusStatus::Inactive => "inactive",
        }
    }

    /// Parse a stored status string, mapping anything unrecognized to
    /// `Inactive` so a hand-edited row cannot take the read path down.
    pub fn parse(s: &str) -> Self {
        match s {
            "idle" => BusStatus::Idle,
            "moving" => BusStatus::Moving,
            "stopped" => BusStatus::Stopped,
            "maintenance" => BusStatus::Maintenance,
            _ => BusStatus::Inactive,
        }
    }
}

/// Immutable snapshot of the canonical live record for a single vehicle.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BusSnapshot {
    pub bus_id: String,
    /// Route the bus is currently assigned to.
    pub route_id: String,
    /// Driver of the most recent accepted event, if any.
    pub driver_id: Option<String>,
    pub online: bool,
    /// Last accepted position; unset until the first sample arrives.
    pub location: Option<GeoPoint>,
    /// Speed in km/h.
    pub speed: f64,
    /// Heading in degrees, 0 <= heading < 360.
    pub heading: f64,
    /// Instant of the most recent transition to online, or sample while
    /// online.
    pub last_online_at: Option<DateTime<Utc>>,
    /// Instant of the most recent accepted change.
    pub last_update_at: Option<DateTime<Utc>>,
    pub status: BusStatus,
}

/// Recency bucket for "last seen" presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LastSeenStatus {
    /// Under 5 minutes ago.
    VeryRecent,
    /// Under 30 minutes ago.
    Recent,
    /// Under 120 minutes ago.
    Moderate,
    /// 120 minutes ago or more.
    Old,
    /// The bus has never reported.
    Unknown,
}

/// Descriptor of when a bus last showed a sign of life.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LastSeen {
    /// `max(last_update_at, last_online_at)`.
    pub timestamp: Option<DateTime<Utc>>,
    pub minutes_ago: Option<i64>,
    pub status: LastSeenStatus,
}

impl LastSeen {
    pub fn of(bus: &BusSnapshot, now: DateTime<Utc>) -> Self {
        let timestamp = match (bus.last_update_at, bus.last_online_at) {
            (Some(u), Some(o)) => Some(u.max(o)),
            (Some(u), None) => Some(u),
            (None, Some(o)) => Some(o),
            (None, None) => None,
        };

        let minutes_ago = timestamp.map(|t| (now - t).num_minutes().max(0));

        let status = match minutes_ago {
            None => LastSeenStatus::Unknown,
            Some(m) if m < 5 => LastSeenStatus::VeryRecent,
            Some(m) if m < 30 => LastSeenStatus::Recent,
            Some(m) if m < 120 => LastSeenStatus::Moderate,
            Some(_) => LastSeenStatus::Old,
        };

        Self {
            timestamp,
            minutes_ago,
            status,
        }
    }
}
