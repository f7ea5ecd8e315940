//! Driver and passenger socket channels.
//!
//! Each accepted connection gets a bounded outbound queue and two tasks:
//! a pump forwarding queued events to the wire under a per-send timeout,
//! and the receive loop below it. Drivers authenticate before the upgrade;
//! passengers are anonymous.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ApiError, AppState};
use crate::auth::{self, DriverIdentity};
use crate::error::TrackError;
use crate::fanout::OutboundQueue;
use crate::geo;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::subscriptions::SocketId;

/// Bounded retries for ingress writes hitting an unavailable store.
const MAX_STORE_RETRIES: u32 = 2;
const RETRY_BASE: Duration = Duration::from_secs(5);
const RETRY_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct DriverWsQuery {
    token: String,
}

/// Per-connection driver session. Owned by the socket task; records the
/// bus last toggled so disconnect can demote it.
#[derive(Debug, Default)]
struct DriverSession {
    last_bus: Option<(String, String)>,
}

/// Driver channel. The handshake carries the token as a query parameter;
/// a bad token answers 401 and the socket never opens.
pub async fn driver_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<DriverWsQuery>,
    State(state): State<AppState>,
) -> Response {
    let identity = match auth::verify(&query.token, &state.jwt) {
        Ok(identity) => identity,
        Err(err) => return ApiError::from(err).into_response(),
    };

    match state.store.get_driver(&identity.driver_id).await {
        Ok(Some(record)) => {
            debug!(driver_id = %record.driver_id, role = %record.role, "driver token verified");
        }
        Ok(None) => return ApiError::from(TrackError::AuthUnknown).into_response(),
        Err(err) => return ApiError::from(err).into_response(),
    }

    ws.on_upgrade(move |socket| handle_driver_socket(socket, state, identity))
}

/// Passenger channel, anonymous.
pub async fn passenger_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_passenger_socket(socket, state))
}

/// Forward queued events to the wire. A send that errors or exceeds the
/// per-send timeout ends the pump, which ends the connection.
async fn pump_outbound(
    queue: Arc<OutboundQueue>,
    mut sender: SplitSink<WebSocket, Message>,
    send_timeout: Duration,
) {
    while let Some(event) = queue.recv().await {
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "failed to serialize outbound event");
                continue;
            }
        };
        match tokio::time::timeout(send_timeout, sender.send(Message::Text(json.into()))).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => break,
            Err(_) => {
                warn!("socket send timed out, closing");
                break;
            }
        }
    }
}

async fn handle_driver_socket(socket: WebSocket, state: AppState, identity: DriverIdentity) {
    let (sender, mut receiver) = socket.split();
    let queue = OutboundQueue::with_capacity(state.config.socket.outbound_queue);
    let socket_id = state.registry.register_socket(queue.handle()).await;
    let send_timeout = Duration::from_secs(state.config.socket.send_timeout_secs);

    info!(driver_id = %identity.driver_id, socket_id, "driver connected");

    let _ = queue
        .push(ServerEvent::Connected {
            message: "Driver channel ready. Send driver:toggle to go on duty.".to_string(),
        })
        .await;

    let pump = tokio::spawn(pump_outbound(queue.clone(), sender, send_timeout));
    let mut session = DriverSession::default();

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let event = match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => event,
                    Err(err) => {
                        debug!(error = %err, "ignoring unparseable driver frame");
                        continue;
                    }
                };
                if let Some(reply) =
                    driver_event_response(&state, socket_id, &identity, &mut session, event).await
                {
                    if queue.push(reply).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Ping(_)) => {
                // Axum answers pongs automatically.
            }
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }

    // Best-effort demotion of the bus this driver was reporting for.
    if let Some((bus_id, route_id)) = session.last_bus.take() {
        if let Err(err) = state
            .store
            .upsert_toggle(&identity.driver_id, &bus_id, &route_id, false, Utc::now())
            .await
        {
            warn!(
                driver_id = %identity.driver_id,
                bus_id = %bus_id,
                error = %err,
                "failed to mark bus offline on driver disconnect"
            );
        }
    }
    state.throttle.evict(&identity.driver_id).await;
    state.registry.drop_socket(socket_id).await;
    pump.abort();
    info!(driver_id = %identity.driver_id, socket_id, "driver disconnected");
}

async fn handle_passenger_socket(socket: WebSocket, state: AppState) {
    let (sender, mut receiver) = socket.split();
    let queue = OutboundQueue::with_capacity(state.config.socket.outbound_queue);
    let socket_id = state.registry.register_socket(queue.handle()).await;
    let send_timeout = Duration::from_secs(state.config.socket.send_timeout_secs);

    debug!(socket_id, "passenger connected");

    let _ = queue
        .push(ServerEvent::Connected {
            message: "Connected. Send subscribe:bus or subscribe:route.".to_string(),
        })
        .await;

    let pump = tokio::spawn(pump_outbound(queue.clone(), sender, send_timeout));

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let event = match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => event,
                    Err(err) => {
                        debug!(error = %err, "ignoring unparseable passenger frame");
                        continue;
                    }
                };
                if let Some(reply) = passenger_event_response(&state, socket_id, event).await {
                    if queue.push(reply).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Ping(_)) => {}
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }

    state.registry.drop_socket(socket_id).await;
    pump.abort();
    debug!(socket_id, "passenger disconnected");
}

/// Retry an ingress write while the store reports itself unavailable,
/// with exponential backoff. The caller surfaces a single error after
/// the final attempt.
async fn with_store_retry<T, F, Fut>(mut op: F) -> Result<T, TrackError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TrackError>>,
{
    let mut delay = RETRY_BASE;
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if err.is_retryable() && attempt < MAX_STORE_RETRIES => {
                attempt += 1;
                warn!(error = %err, attempt, wait_secs = delay.as_secs(), "store write failed, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_CAP);
            }
            other => return other,
        }
    }
}

/// Handle one driver event and produce the direct reply, if any.
/// External broadcasts happen via the change stream, never from here.
async fn driver_event_response(
    state: &AppState,
    socket_id: SocketId,
    identity: &DriverIdentity,
    session: &mut DriverSession,
    event: ClientEvent,
) -> Option<ServerEvent> {
    match event {
        ClientEvent::DriverToggle { bus_id, online } => {
            let now = Utc::now();
            let assignment = match state
                .store
                .find_active_assignment(&identity.driver_id, &bus_id, now)
                .await
            {
                Ok(Some(assignment)) => assignment,
                Ok(None) => {
                    return Some(ServerEvent::ToggleError {
                        error: TrackError::NoActiveAssignment.code().to_string(),
                    })
                }
                Err(err) => {
                    return Some(ServerEvent::ToggleError {
                        error: err.code().to_string(),
                    })
                }
            };

            let result = with_store_retry(|| {
                state.store.upsert_toggle(
                    &identity.driver_id,
                    &bus_id,
                    &assignment.route_id,
                    online,
                    now,
                )
            })
            .await;

            match result {
                Ok(_) => {
                    // The driver joins its own rooms so it sees the same
                    // corroborating broadcasts its passengers do.
                    state.registry.subscribe_bus(socket_id, &bus_id).await;
                    state
                        .registry
                        .subscribe_route(socket_id, &assignment.route_id)
                        .await;
                    session.last_bus = Some((bus_id.clone(), assignment.route_id.clone()));
                    Some(ServerEvent::ToggleSuccess {
                        bus_id,
                        online,
                        timestamp: now,
                    })
                }
                Err(err) => Some(ServerEvent::ToggleError {
                    error: err.code().to_string(),
                }),
            }
        }

        ClientEvent::DriverMove {
            bus_id,
            lng,
            lat,
            speed,
            heading,
            ts,
        } => {
            // Redundant samples are dropped silently, before any other work.
            if !state
                .throttle
                .should_accept(&identity.driver_id, lng, lat, ts)
                .await
            {
                return None;
            }

            let now = Utc::now();
            let assignment = match state
                .store
                .find_active_assignment(&identity.driver_id, &bus_id, now)
                .await
            {
                Ok(Some(assignment)) => assignment,
                Ok(None) => {
                    return Some(ServerEvent::MoveError {
                        error: TrackError::NoActiveAssignment.code().to_string(),
                    })
                }
                Err(err) => {
                    return Some(ServerEvent::MoveError {
                        error: err.code().to_string(),
                    })
                }
            };

            if let Err(err) = validate_sample(lng, lat, speed, heading) {
                return Some(ServerEvent::MoveError {
                    error: err.code().to_string(),
                });
            }

            let result = with_store_retry(|| {
                state.store.upsert_sample(
                    &identity.driver_id,
                    &bus_id,
                    &assignment.route_id,
                    lng,
                    lat,
                    speed,
                    heading,
                    now,
                )
            })
            .await;

            match result {
                Ok(_) => {
                    session.last_bus = Some((bus_id.clone(), assignment.route_id.clone()));
                    Some(ServerEvent::MoveSuccess {
                        bus_id,
                        timestamp: now,
                    })
                }
                Err(err) => Some(ServerEvent::MoveError {
                    error: err.code().to_string(),
                }),
            }
        }

        // Drivers may also subscribe like passengers do.
        other => passenger_event_response(state, socket_id, other).await,
    }
}

fn validate_sample(lng: f64, lat: f64, speed: f64, heading: f64) -> Result<(), TrackError> {
    if !geo::valid_coord(lng, lat) {
        return Err(TrackError::InvalidCoord);
    }
    if !speed.is_finite() || !(0.0..=200.0).contains(&speed) {
        return Err(TrackError::InvalidSpeed);
    }
    if !heading.is_finite() || !(0.0..360.0).contains(&heading) {
        return Err(TrackError::InvalidHeading);
    }
    Ok(())
}

/// Handle one passenger event. Subscriptions answer with an immediate
/// snapshot so the client has initial state; unsubscribes answer nothing.
async fn passenger_event_response(
    state: &AppState,
    socket_id: SocketId,
    event: ClientEvent,
) -> Option<ServerEvent> {
    match event {
        ClientEvent::SubscribeBus { bus_id } => {
            state.registry.subscribe_bus(socket_id, &bus_id).await;
            match state.store.get(&bus_id).await {
                Ok(Some(snapshot)) => Some(ServerEvent::status_of(&snapshot, None, Utc::now())),
                Ok(None) => None,
                Err(err) => {
                    warn!(bus_id = %bus_id, error = %err, "snapshot read failed on subscribe");
                    None
                }
            }
        }
        ClientEvent::UnsubscribeBus { bus_id } => {
            state.registry.unsubscribe_bus(socket_id, &bus_id).await;
            None
        }
        ClientEvent::SubscribeRoute { route_id } => {
            state.registry.subscribe_route(socket_id, &route_id).await;
            match state.store.list_online_on_route(&route_id).await {
                Ok(buses) => Some(ServerEvent::RouteBuses {
                    route_id,
                    buses,
                    timestamp: Utc::now(),
                }),
                Err(err) => {
                    warn!(route_id = %route_id, error = %err, "route snapshot failed on subscribe");
                    None
                }
            }
        }
        ClientEvent::UnsubscribeRoute { route_id } => {
            state.registry.unsubscribe_route(socket_id, &route_id).await;
            None
        }
        // Driver verbs on a passenger path are ignored.
        ClientEvent::DriverToggle { .. } | ClientEvent::DriverMove { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::JwtConfig;
    use crate::config::Config;
    use crate::store::tests::{memory_store, seed_assignment, seed_driver, seed_route};
    use crate::store::BusStore;
    use crate::subscriptions::SubscriptionRegistry;
    use crate::throttle::ThrottleRegistry;
    use chrono::{Duration as ChronoDuration, Utc};

    async fn test_state() -> AppState {
        let store = Arc::new(memory_store().await);
        let config: Config = serde_yaml::from_str("{}").unwrap();
        AppState {
            store,
            registry: Arc::new(SubscriptionRegistry::new()),
            throttle: Arc::new(ThrottleRegistry::new(config.throttle)),
            jwt: Arc::new(JwtConfig::for_testing()),
            config: Arc::new(config),
        }
    }

    async fn seed_shift(store: &BusStore) {
        seed_driver(store, "DRV1").await;
        seed_route(store, "RT1", &[("S1", 77.67, 27.49), ("S2", 77.70, 27.49)]).await;
        let now = Utc::now();
        seed_assignment(
            store,
            "A1",
            "DRV1",
            "BUS001",
            "RT1",
            now - ChronoDuration::hours(1),
            now + ChronoDuration::hours(1),
            true,
        )
        .await;
    }

    fn identity() -> DriverIdentity {
        DriverIdentity {
            driver_id: "DRV1".to_string(),
            phone: "+490000000".to_string(),
            role: crate::auth::Role::Driver,
        }
    }

    fn move_event(lng: f64, ts: i64) -> ClientEvent {
        ClientEvent::DriverMove {
            bus_id: "BUS001".to_string(),
            lng,
            lat: 27.49,
            speed: 30.0,
            heading: 90.0,
            ts,
        }
    }

    #[tokio::test]
    async fn toggle_without_assignment_fails_and_writes_nothing() {
        let state = test_state().await;
        let queue = OutboundQueue::with_capacity(8);
        let socket_id = state.registry.register_socket(queue.handle()).await;
        let mut session = DriverSession::default();

        let reply = driver_event_response(
            &state,
            socket_id,
            &identity(),
            &mut session,
            ClientEvent::DriverToggle {
                bus_id: "BUS001".to_string(),
                online: true,
            },
        )
        .await;

        assert!(matches!(
            reply,
            Some(ServerEvent::ToggleError { ref error }) if error == "NoActiveAssignment"
        ));
        assert!(state.store.get("BUS001").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn toggle_success_joins_rooms_and_tracks_session() {
        let state = test_state().await;
        seed_shift(&state.store).await;
        let queue = OutboundQueue::with_capacity(8);
        let socket_id = state.registry.register_socket(queue.handle()).await;
        let mut session = DriverSession::default();

        let reply = driver_event_response(
            &state,
            socket_id,
            &identity(),
            &mut session,
            ClientEvent::DriverToggle {
                bus_id: "BUS001".to_string(),
                online: true,
            },
        )
        .await;

        assert!(matches!(
            reply,
            Some(ServerEvent::ToggleSuccess { online: true, .. })
        ));
        assert_eq!(
            session.last_bus,
            Some(("BUS001".to_string(), "RT1".to_string()))
        );
        let snapshot = state.store.get("BUS001").await.unwrap().unwrap();
        assert!(snapshot.online);
        // The driver's own socket is a member of both rooms now.
        assert_eq!(state.registry.members_for("BUS001", "RT1").await.len(), 1);
    }

    #[tokio::test]
    async fn move_without_assignment_reports_error_and_writes_nothing() {
        let state = test_state().await;
        // Driver exists but holds no assignment.
        seed_driver(&state.store, "DRV1").await;
        let queue = OutboundQueue::with_capacity(8);
        let socket_id = state.registry.register_socket(queue.handle()).await;
        let mut session = DriverSession::default();

        let reply = driver_event_response(
            &state,
            socket_id,
            &identity(),
            &mut session,
            move_event(77.67, 0),
        )
        .await;

        assert!(matches!(
            reply,
            Some(ServerEvent::MoveError { ref error }) if error == "NoActiveAssignment"
        ));
        assert!(state.store.get("BUS001").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn throttled_move_is_silently_dropped() {
        let state = test_state().await;
        seed_shift(&state.store).await;
        let queue = OutboundQueue::with_capacity(8);
        let socket_id = state.registry.register_socket(queue.handle()).await;
        let mut session = DriverSession::default();

        let first = driver_event_response(
            &state,
            socket_id,
            &identity(),
            &mut session,
            move_event(77.67, 0),
        )
        .await;
        assert!(matches!(first, Some(ServerEvent::MoveSuccess { .. })));

        // 1 s later: inside the 2 s minimum interval, no reply at all.
        let second = driver_event_response(
            &state,
            socket_id,
            &identity(),
            &mut session,
            move_event(77.675, 1000),
        )
        .await;
        assert!(second.is_none());

        // 3 s later and far enough: accepted again.
        let third = driver_event_response(
            &state,
            socket_id,
            &identity(),
            &mut session,
            move_event(77.68, 3000),
        )
        .await;
        assert!(matches!(third, Some(ServerEvent::MoveSuccess { .. })));
    }

    #[tokio::test]
    async fn out_of_range_sample_is_rejected_per_field() {
        let state = test_state().await;
        seed_shift(&state.store).await;
        let queue = OutboundQueue::with_capacity(8);
        let socket_id = state.registry.register_socket(queue.handle()).await;
        let mut session = DriverSession::default();

        let cases: Vec<(ClientEvent, &str)> = vec![
            (
                ClientEvent::DriverMove {
                    bus_id: "BUS001".to_string(),
                    lng: 181.0,
                    lat: 27.49,
                    speed: 30.0,
                    heading: 90.0,
                    ts: 0,
                },
                "InvalidCoord",
            ),
            (
                ClientEvent::DriverMove {
                    bus_id: "BUS001".to_string(),
                    lng: 77.67,
                    lat: 27.49,
                    speed: 250.0,
                    heading: 90.0,
                    ts: 10_000,
                },
                "InvalidSpeed",
            ),
            (
                ClientEvent::DriverMove {
                    bus_id: "BUS001".to_string(),
                    lng: 77.70,
                    lat: 27.49,
                    speed: 30.0,
                    heading: 360.0,
                    ts: 20_000,
                },
                "InvalidHeading",
            ),
        ];

        for (event, expected) in cases {
            let reply =
                driver_event_response(&state, socket_id, &identity(), &mut session, event).await;
            assert!(
                matches!(reply, Some(ServerEvent::MoveError { ref error }) if error == expected),
                "expected {}",
                expected
            );
        }
        assert!(state.store.get("BUS001").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn subscribe_bus_snapshots_existing_state() {
        let state = test_state().await;
        seed_shift(&state.store).await;
        let before = Utc::now();
        state
            .store
            .upsert_toggle("DRV1", "BUS001", "RT1", true, before)
            .await
            .unwrap();

        let queue = OutboundQueue::with_capacity(8);
        let socket_id = state.registry.register_socket(queue.handle()).await;

        let reply = passenger_event_response(
            &state,
            socket_id,
            ClientEvent::SubscribeBus {
                bus_id: "BUS001".to_string(),
            },
        )
        .await;

        match reply {
            Some(ServerEvent::BusStatusEvent {
                online,
                last_update_at,
                ..
            }) => {
                assert!(online);
                // Snapshot freshness: state as of some instant <= now.
                assert!(last_update_at.unwrap() <= Utc::now());
            }
            other => panic!("expected bus:status, got {:?}", other),
        }

        // Unknown bus registers membership but stays silent.
        let silent = passenger_event_response(
            &state,
            socket_id,
            ClientEvent::SubscribeBus {
                bus_id: "GHOST".to_string(),
            },
        )
        .await;
        assert!(silent.is_none());
    }

    #[tokio::test]
    async fn subscribe_route_lists_online_buses_only() {
        let state = test_state().await;
        seed_shift(&state.store).await;
        let now = Utc::now();
        state
            .store
            .upsert_sample("DRV1", "BUS001", "RT1", 77.67, 27.49, 20.0, 90.0, now)
            .await
            .unwrap();
        state
            .store
            .upsert_toggle("DRV2", "BUS002", "RT1", false, now)
            .await
            .unwrap();

        let queue = OutboundQueue::with_capacity(8);
        let socket_id = state.registry.register_socket(queue.handle()).await;

        let reply = passenger_event_response(
            &state,
            socket_id,
            ClientEvent::SubscribeRoute {
                route_id: "RT1".to_string(),
            },
        )
        .await;

        match reply {
            Some(ServerEvent::RouteBuses { buses, .. }) => {
                assert_eq!(buses.len(), 1);
                assert_eq!(buses[0].bus_id, "BUS001");
            }
            other => panic!("expected route:buses, got {:?}", other),
        }
    }

    #[test]
    fn sample_validation_boundaries() {
        assert!(validate_sample(77.67, 27.49, 0.0, 0.0).is_ok());
        assert!(validate_sample(180.0, -90.0, 200.0, 359.9).is_ok());
        assert!(matches!(
            validate_sample(180.1, 0.0, 0.0, 0.0),
            Err(TrackError::InvalidCoord)
        ));
        assert!(matches!(
            validate_sample(0.0, 0.0, 200.1, 0.0),
            Err(TrackError::InvalidSpeed)
        ));
        assert!(matches!(
            validate_sample(0.0, 0.0, 0.0, -0.1),
            Err(TrackError::InvalidHeading)
        ));
        assert!(matches!(
            validate_sample(0.0, 0.0, 0.0, 360.0),
            Err(TrackError::InvalidHeading)
        ));
    }
}
