//! ETA worker.
//!
//! Periodically estimates the arrival of every online bus at its next
//! stop and broadcasts `eta:update` to the bus and route rooms. The
//! "next stop" is the stop closest by straight-line distance; snapping to
//! the polyline or guaranteeing the stop lies ahead of the bus is out of
//! scope, so a bus just past a stop may briefly get that stop again.
//! These events go through the broadcaster's direct room path, not the
//! change stream.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::EtaConfig;
use crate::error::TrackError;
use crate::fanout::Broadcaster;
use crate::geo;
use crate::models::{GeoPoint, Route, Stop};
use crate::protocol::{NextStop, ServerEvent};
use crate::store::BusStore;

/// A speed below this floor would produce absurd ETAs; clamp to it.
const MIN_SPEED_KMH: f64 = 1.0;

pub struct EtaWorker {
    store: Arc<BusStore>,
    broadcaster: Broadcaster,
    config: EtaConfig,
    /// EWMA speed per bus; entries evaporate when a bus goes offline.
    speeds: HashMap<String, f64>,
}

impl EtaWorker {
    pub fn new(store: Arc<BusStore>, broadcaster: Broadcaster, config: EtaConfig) -> Self {
        Self {
            store,
            broadcaster,
            config,
            speeds: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            self.config.tick_interval_secs.max(1),
        ));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("eta worker stopping");
                    return;
                }
                _ = interval.tick() => {
                    match self.run_pass(Utc::now()).await {
                        Ok(emitted) => debug!(emitted, "eta pass complete"),
                        Err(err) => warn!(error = %err, "eta pass failed, skipping tick"),
                    }
                }
            }
        }
    }

    /// One pass over every online bus. Returns the number of estimates
    /// emitted.
    pub async fn run_pass(&mut self, now: DateTime<Utc>) -> Result<usize, TrackError> {
        let online = self.store.list_online().await?;

        // Buses demoted since the last tick lose their smoothing state.
        let online_ids: HashSet<&str> = online.iter().map(|b| b.bus_id.as_str()).collect();
        self.speeds.retain(|id, _| online_ids.contains(id.as_str()));

        let mut routes: HashMap<String, Option<Route>> = HashMap::new();
        let mut emitted = 0;

        for bus in &online {
            let Some(location) = bus.location else {
                continue;
            };

            let route = match routes.entry(bus.route_id.clone()) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    let fetched = self.store.get_route(&bus.route_id).await?;
                    entry.insert(fetched)
                }
            };
            let Some(route) = route.as_ref() else {
                continue;
            };
            if route.stops.is_empty() {
                continue;
            }

            let prev = self.speeds.get(&bus.bus_id).copied();
            let smoothed = smooth_speed(prev, bus.speed, self.config.smoothing_alpha);
            self.speeds.insert(bus.bus_id.clone(), smoothed);

            let estimate = estimate_next_stop(location, &route.stops, smoothed);
            let event = ServerEvent::EtaUpdate {
                bus_id: bus.bus_id.clone(),
                route_id: bus.route_id.clone(),
                next_stop: NextStop {
                    stop_id: estimate.stop.stop_id.clone(),
                    name: estimate.stop.name.clone(),
                    distance_m: estimate.distance_m,
                    eta_minutes: estimate.eta_minutes,
                },
                route_progress: estimate.route_progress,
                estimated_arrival: now + Duration::minutes(estimate.eta_minutes),
                timestamp: now,
            };
            self.broadcaster
                .deliver_to_rooms(&bus.bus_id, &bus.route_id, event)
                .await;
            emitted += 1;
        }

        Ok(emitted)
    }
}

/// EWMA of the bus speed with a floor. With no history the current sample
/// stands alone.
fn smooth_speed(prev: Option<f64>, current: f64, alpha: f64) -> f64 {
    let smoothed = match prev {
        Some(prev) => alpha * current + (1.0 - alpha) * prev,
        None => current,
    };
    smoothed.max(MIN_SPEED_KMH)
}

struct StopEstimate<'a> {
    stop: &'a Stop,
    distance_m: f64,
    eta_minutes: i64,
    route_progress: f64,
}

/// Closest stop by straight-line distance, with ETA at the smoothed speed.
fn estimate_next_stop(location: GeoPoint, stops: &[Stop], speed_kmh: f64) -> StopEstimate<'_> {
    let mut closest = 0;
    let mut closest_distance = f64::INFINITY;
    for (index, stop) in stops.iter().enumerate() {
        let d = geo::haversine_m(location.lng, location.lat, stop.lng, stop.lat);
        if d < closest_distance {
            closest = index;
            closest_distance = d;
        }
    }

    let route_progress = if stops.len() > 1 {
        closest as f64 / (stops.len() - 1) as f64
    } else {
        0.0
    };

    StopEstimate {
        stop: &stops[closest],
        distance_m: closest_distance,
        eta_minutes: eta_minutes(closest_distance, speed_kmh),
        route_progress,
    }
}

/// Minutes to cover `distance_m` at `speed_kmh`, rounded up, at least 1.
fn eta_minutes(distance_m: f64, speed_kmh: f64) -> i64 {
    let minutes = (distance_m / 1000.0) / (speed_kmh / 60.0);
    (minutes.ceil() as i64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::OutboundQueue;
    use crate::store::tests::{memory_store, seed_route};
    use crate::subscriptions::SubscriptionRegistry;

    fn stop(id: &str, lng: f64, lat: f64) -> Stop {
        Stop {
            stop_id: id.to_string(),
            name: format!("Stop {}", id),
            lng,
            lat,
            estimated_offset_minutes: None,
        }
    }

    #[test]
    fn eta_arithmetic_rounds_up_with_floor_of_one() {
        // 1 km at 60 km/h is exactly one minute.
        assert_eq!(eta_minutes(1000.0, 60.0), 1);
        // 1.1 km at 60 km/h rounds up to two.
        assert_eq!(eta_minutes(1100.0, 60.0), 2);
        // 1.5 km at 30 km/h is three minutes.
        assert_eq!(eta_minutes(1500.0, 30.0), 3);
        // A stone's throw away still reports one minute.
        assert_eq!(eta_minutes(50.0, 60.0), 1);
    }

    #[test]
    fn speed_smoothing_weights_and_floors() {
        assert_eq!(smooth_speed(None, 20.0, 0.3), 20.0);
        let s = smooth_speed(Some(10.0), 20.0, 0.3);
        assert!((s - 13.0).abs() < 1e-9);
        // A stopped bus never divides the ETA by zero.
        assert_eq!(smooth_speed(Some(0.4), 0.0, 0.3), MIN_SPEED_KMH);
        assert_eq!(smooth_speed(None, 0.0, 0.3), MIN_SPEED_KMH);
    }

    #[test]
    fn picks_closest_stop_and_reports_progress() {
        let stops = vec![
            stop("S1", 77.60, 27.49),
            stop("S2", 77.67, 27.49),
            stop("S3", 77.74, 27.49),
        ];
        // Just east of S2.
        let estimate = estimate_next_stop(GeoPoint { lng: 77.675, lat: 27.49 }, &stops, 30.0);
        assert_eq!(estimate.stop.stop_id, "S2");
        assert!((estimate.route_progress - 0.5).abs() < 1e-9);
        assert!((estimate.distance_m - 493.0).abs() < 20.0);
    }

    #[test]
    fn single_stop_route_has_zero_progress() {
        let stops = vec![stop("ONLY", 77.67, 27.49)];
        let estimate = estimate_next_stop(GeoPoint { lng: 77.68, lat: 27.49 }, &stops, 30.0);
        assert_eq!(estimate.stop.stop_id, "ONLY");
        assert_eq!(estimate.route_progress, 0.0);
    }

    #[tokio::test]
    async fn pass_broadcasts_to_route_subscribers_and_evicts_offline_state() {
        let store = Arc::new(memory_store().await);
        seed_route(&store, "RT1", &[("S1", 77.67, 27.49), ("S2", 77.70, 27.49)]).await;
        let registry = Arc::new(SubscriptionRegistry::new());
        let broadcaster = Broadcaster::new(store.clone(), registry.clone());
        let config: EtaConfig = crate::config::EtaConfig {
            tick_interval_secs: 10,
            smoothing_alpha: 0.3,
        };
        let mut worker = EtaWorker::new(store.clone(), broadcaster, config);

        let queue = OutboundQueue::with_capacity(8);
        let socket_id = registry.register_socket(queue.handle()).await;
        registry.subscribe_route(socket_id, "RT1").await;

        let now = Utc::now();
        store
            .upsert_sample("D1", "BUS001", "RT1", 77.68, 27.49, 30.0, 90.0, now)
            .await
            .unwrap();

        let emitted = worker.run_pass(now).await.unwrap();
        assert_eq!(emitted, 1);
        assert!(worker.speeds.contains_key("BUS001"));

        match queue.recv().await.unwrap() {
            ServerEvent::EtaUpdate {
                bus_id, next_stop, ..
            } => {
                assert_eq!(bus_id, "BUS001");
                assert!(next_stop.eta_minutes >= 1);
            }
            other => panic!("expected eta:update, got {:?}", other),
        }

        // Once the bus is demoted its smoothing state evaporates.
        store.mark_stale("BUS001", now).await.unwrap();
        let emitted = worker.run_pass(now).await.unwrap();
        assert_eq!(emitted, 0);
        assert!(!worker.speeds.contains_key("BUS001"));
    }

    #[tokio::test]
    async fn buses_without_location_or_stops_are_skipped() {
        let store = Arc::new(memory_store().await);
        seed_route(&store, "EMPTY", &[]).await;
        let registry = Arc::new(SubscriptionRegistry::new());
        let broadcaster = Broadcaster::new(store.clone(), registry.clone());
        let mut worker = EtaWorker::new(
            store.clone(),
            broadcaster,
            crate::config::EtaConfig {
                tick_interval_secs: 10,
                smoothing_alpha: 0.3,
            },
        );

        let now = Utc::now();
        // Online but never sampled: no location.
        store
            .upsert_toggle("D1", "NOLOC", "RT1", true, now)
            .await
            .unwrap();
        // Located but its route has no stops.
        store
            .upsert_sample("D2", "NOSTOPS", "EMPTY", 77.67, 27.49, 30.0, 0.0, now)
            .await
            .unwrap();

        assert_eq!(worker.run_pass(now).await.unwrap(), 0);
    }
}
