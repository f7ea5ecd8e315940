//! Socket wire protocol.
//!
//! All frames are JSON objects tagged by `type`. Inbound frames come from
//! driver and passenger clients; outbound frames are composed by the
//! ingress handlers, the broadcaster and the ETA worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::{BusSnapshot, BusStatus, GeoPoint};
use crate::store::{BusChanged, ChangeKind};

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "driver:toggle")]
    DriverToggle { bus_id: String, online: bool },
    #[serde(rename = "driver:move")]
    DriverMove {
        bus_id: String,
        lng: f64,
        lat: f64,
        speed: f64,
        heading: f64,
        /// Client sample timestamp, epoch milliseconds.
        ts: i64,
    },
    #[serde(rename = "subscribe:bus")]
    SubscribeBus { bus_id: String },
    #[serde(rename = "unsubscribe:bus")]
    UnsubscribeBus { bus_id: String },
    #[serde(rename = "subscribe:route")]
    SubscribeRoute { route_id: String },
    #[serde(rename = "unsubscribe:route")]
    UnsubscribeRoute { route_id: String },
}

/// Next-stop estimate carried by `eta:update`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct NextStop {
    pub stop_id: String,
    pub name: String,
    /// Straight-line distance to the stop, metres.
    pub distance_m: f64,
    pub eta_minutes: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "connected")]
    Connected { message: String },
    #[serde(rename = "bus:status")]
    BusStatusEvent {
        bus_id: String,
        route_id: String,
        online: bool,
        status: BusStatus,
        last_online_at: Option<DateTime<Utc>>,
        last_update_at: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "bus:update")]
    BusUpdate {
        bus_id: String,
        route_id: String,
        location: GeoPoint,
        speed: f64,
        heading: f64,
        last_update_at: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "route:buses")]
    RouteBuses {
        route_id: String,
        buses: Vec<BusSnapshot>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "eta:update")]
    EtaUpdate {
        bus_id: String,
        route_id: String,
        next_stop: NextStop,
        /// Fraction of the stop sequence already covered, 0.0..=1.0.
        route_progress: f64,
        estimated_arrival: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "driver:toggle:success")]
    ToggleSuccess {
        bus_id: String,
        online: bool,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "driver:toggle:error")]
    ToggleError { error: String },
    #[serde(rename = "driver:move:success")]
    MoveSuccess {
        bus_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "driver:move:error")]
    MoveError { error: String },
}

impl ServerEvent {
    /// Public status payload for a snapshot, used both for the change
    /// stream and for the snapshot emitted on `subscribe:bus`.
    pub fn status_of(snapshot: &BusSnapshot, reason: Option<&str>, timestamp: DateTime<Utc>) -> Self {
        ServerEvent::BusStatusEvent {
            bus_id: snapshot.bus_id.clone(),
            route_id: snapshot.route_id.clone(),
            online: snapshot.online,
            status: snapshot.status,
            last_online_at: snapshot.last_online_at,
            last_update_at: snapshot.last_update_at,
            reason: reason.map(str::to_string),
            timestamp,
        }
    }

    /// Translate an accepted mutation into its public broadcast payload.
    /// Returns `None` for update events lacking a location (cannot happen
    /// after a sample write, but the wire format requires one).
    pub fn from_change(event: &BusChanged) -> Option<Self> {
        match event.kind {
            ChangeKind::Update => {
                let location = event.snapshot.location?;
                Some(ServerEvent::BusUpdate {
                    bus_id: event.bus_id.clone(),
                    route_id: event.route_id.clone(),
                    location,
                    speed: event.snapshot.speed,
                    heading: event.snapshot.heading,
                    last_update_at: event.snapshot.last_update_at,
                    timestamp: event.mutation_instant,
                })
            }
            ChangeKind::Status => Some(Self::status_of(&event.snapshot, None, event.mutation_instant)),
            ChangeKind::Stale => Some(Self::status_of(
                &event.snapshot,
                Some("stale_timeout"),
                event.mutation_instant,
            )),
        }
    }

    /// Position updates are absorptive: under back-pressure a newer one
    /// may replace an older one for the same bus. Everything else must
    /// reach the socket or kill it.
    pub fn absorptive(&self) -> bool {
        matches!(
            self,
            ServerEvent::BusUpdate { .. } | ServerEvent::EtaUpdate { .. }
        )
    }

    /// Bus this event pertains to, for coalescing.
    pub fn bus_id(&self) -> Option<&str> {
        match self {
            ServerEvent::BusStatusEvent { bus_id, .. }
            | ServerEvent::BusUpdate { bus_id, .. }
            | ServerEvent::EtaUpdate { bus_id, .. } => Some(bus_id),
            _ => None,
        }
    }
}
