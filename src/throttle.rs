//! Per-driver location throttle.
//!
//! Suppresses samples closer than a minimum interval or distance to the
//! last accepted sample, bounding downstream write and fan-out rates no
//! matter how fast a device reports. The registry is process-local and
//! non-durable: after a restart the first sample is always accepted.

use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::config::ThrottleConfig;
use crate::geo;

#[derive(Debug, Clone, Copy)]
struct ThrottleEntry {
    client_ts: i64,
    lng: f64,
    lat: f64,
}

pub struct ThrottleRegistry {
    min_interval_ms: i64,
    min_distance_m: f64,
    entries: RwLock<HashMap<String, ThrottleEntry>>,
}

impl ThrottleRegistry {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            min_interval_ms: config.min_interval_ms,
            min_distance_m: config.min_distance_m,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Decide whether a sample passes the throttle, atomically recording it
    /// as the new reference point if it does.
    pub async fn should_accept(&self, driver_id: &str, lng: f64, lat: f64, client_ts: i64) -> bool {
        let mut entries = self.entries.write().await;

        if let Some(prev) = entries.get(driver_id) {
            if client_ts - prev.client_ts < self.min_interval_ms {
                return false;
            }
            if geo::haversine_m(prev.lng, prev.lat, lng, lat) < self.min_distance_m {
                return false;
            }
        }

        entries.insert(
            driver_id.to_string(),
            ThrottleEntry {
                client_ts,
                lng,
                lat,
            },
        );
        true
    }

    /// Clear a driver's reference point. Called on driver disconnect.
    pub async fn evict(&self, driver_id: &str) {
        self.entries.write().await.remove(driver_id);
    }
}
