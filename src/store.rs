//! Bus state store.
//!
//! Owns every piece of SQL in the crate: the canonical bus records, the
//! read-only driver/route/assignment tables, and the nearby query. All
//! bus writes are serialized per `bus_id` by an async lock held across the
//! write and the change-stream emit, so events for one bus always appear
//! in write order. Readers go straight to the pool.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

use crate::error::TrackError;
use crate::geo;
use crate::models::{Assignment, AssignmentStatus, BusSnapshot, BusStatus, GeoPoint, Route, Stop};

/// Capacity of the in-process change stream. Slow consumers observe
/// `Lagged` and reconcile via snapshot-on-subscribe.
const CHANGE_STREAM_CAPACITY: usize = 256;

/// A bus is considered in motion above this speed.
const MOVING_SPEED_KMH: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Online flag flipped by a driver toggle.
    Status,
    /// Accepted position sample.
    Update,
    /// Demoted by the staleness sweep.
    Stale,
}

/// One accepted mutation of a bus record.
#[derive(Debug, Clone)]
pub struct BusChanged {
    pub bus_id: String,
    pub route_id: String,
    pub driver_id: Option<String>,
    pub kind: ChangeKind,
    pub snapshot: BusSnapshot,
    pub mutation_instant: DateTime<Utc>,
}

/// Driver identity record, read-only for the core.
#[derive(Debug, Clone, FromRow)]
pub struct DriverRecord {
    pub driver_id: String,
    pub phone: String,
    pub role: String,
}

#[derive(Debug, FromRow)]
struct BusRow {
    bus_id: String,
    route_id: String,
    driver_id: Option<String>,
    online: bool,
    lng: Option<f64>,
    lat: Option<f64>,
    speed: f64,
    heading: f64,
    last_online_at: Option<DateTime<Utc>>,
    last_update_at: Option<DateTime<Utc>>,
    status: String,
}

impl BusRow {
    fn into_snapshot(self) -> BusSnapshot {
        let location = match (self.lng, self.lat) {
            (Some(lng), Some(lat)) => Some(GeoPoint { lng, lat }),
            _ => None,
        };
        BusSnapshot {
            bus_id: self.bus_id,
            route_id: self.route_id,
            driver_id: self.driver_id,
            online: self.online,
            location,
            speed: self.speed,
            heading: self.heading,
            last_online_at: self.last_online_at,
            last_update_at: self.last_update_at,
            status: BusStatus::parse(&self.status),
        }
    }
}

#[derive(Debug, FromRow)]
struct AssignmentRow {
    assignment_id: String,
    driver_id: String,
    bus_id: String,
    route_id: String,
    shift_start: DateTime<Utc>,
    shift_end: DateTime<Utc>,
    status: String,
    active: bool,
}

impl AssignmentRow {
    fn into_assignment(self) -> Assignment {
        Assignment {
            assignment_id: self.assignment_id,
            driver_id: self.driver_id,
            bus_id: self.bus_id,
            route_id: self.route_id,
            shift_start: self.shift_start,
            shift_end: self.shift_end,
            status: AssignmentStatus::parse(&self.status),
            active: self.active,
        }
    }
}

#[derive(Debug, FromRow)]
struct RouteRow {
    route_id: String,
    name: String,
    polyline: String,
    stops: String,
}

pub struct BusStore {
    pool: SqlitePool,
    changes_tx: broadcast::Sender<BusChanged>,
    bus_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BusStore {
    pub fn new(pool: SqlitePool) -> Self {
        let (changes_tx, _) = broadcast::channel(CHANGE_STREAM_CAPACITY);
        Self {
            pool,
            changes_tx,
            bus_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to the stream of accepted mutations. Events for one bus
    /// arrive in write order; no cross-bus ordering is promised.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<BusChanged> {
        self.changes_tx.subscribe()
    }

    async fn lock_for(&self, bus_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.bus_locks.lock().await;
        locks
            .entry(bus_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn emit(&self, kind: ChangeKind, snapshot: BusSnapshot, now: DateTime<Utc>) {
        let event = BusChanged {
            bus_id: snapshot.bus_id.clone(),
            route_id: snapshot.route_id.clone(),
            driver_id: snapshot.driver_id.clone(),
            kind,
            snapshot,
            mutation_instant: now,
        };
        // No receivers is fine; subscribers reconcile on subscribe.
        let _ = self.changes_tx.send(event);
    }

    async fn fetch_snapshot(&self, bus_id: &str) -> Result<Option<BusSnapshot>, TrackError> {
        let row: Option<BusRow> = sqlx::query_as("SELECT * FROM buses WHERE bus_id = ?")
            .bind(bus_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(BusRow::into_snapshot))
    }

    /// Flip a bus online or offline, creating the record on first contact.
    pub async fn upsert_toggle(
        &self,
        driver_id: &str,
        bus_id: &str,
        route_id: &str,
        online: bool,
        now: DateTime<Utc>,
    ) -> Result<BusSnapshot, TrackError> {
        let lock = self.lock_for(bus_id).await;
        let _guard = lock.lock().await;

        let status = if online {
            BusStatus::Idle
        } else {
            BusStatus::Inactive
        };
        let online_at = online.then_some(now);

        sqlx::query(
            r#"
            INSERT INTO buses (bus_id, route_id, driver_id, online, speed, heading,
                               last_online_at, last_update_at, status)
            VALUES (?, ?, ?, ?, 0, 0, ?, ?, ?)
            ON CONFLICT(bus_id) DO UPDATE SET
                route_id = excluded.route_id,
                driver_id = excluded.driver_id,
                online = excluded.online,
                last_online_at = CASE WHEN excluded.online
                                      THEN excluded.last_online_at
                                      ELSE buses.last_online_at END,
                last_update_at = excluded.last_update_at,
                status = excluded.status
            "#,
        )
        .bind(bus_id)
        .bind(route_id)
        .bind(driver_id)
        .bind(online)
        .bind(online_at)
        .bind(now)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        let snapshot = self
            .fetch_snapshot(bus_id)
            .await?
            .ok_or_else(|| TrackError::StoreUnavailable(sqlx::Error::RowNotFound))?;
        self.emit(ChangeKind::Status, snapshot.clone(), now);
        Ok(snapshot)
    }

    /// Record an accepted position sample. Forces the bus online and
    /// advances both timestamps.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_sample(
        &self,
        driver_id: &str,
        bus_id: &str,
        route_id: &str,
        lng: f64,
        lat: f64,
        speed: f64,
        heading: f64,
        now: DateTime<Utc>,
    ) -> Result<BusSnapshot, TrackError> {
        let lock = self.lock_for(bus_id).await;
        let _guard = lock.lock().await;

        let status = if speed >= MOVING_SPEED_KMH {
            BusStatus::Moving
        } else {
            BusStatus::Stopped
        };

        sqlx::query(
            r#"
            INSERT INTO buses (bus_id, route_id, driver_id, online, lng, lat, speed, heading,
                               last_online_at, last_update_at, status)
            VALUES (?, ?, ?, 1, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bus_id) DO UPDATE SET
                route_id = excluded.route_id,
                driver_id = excluded.driver_id,
                online = 1,
                lng = excluded.lng,
                lat = excluded.lat,
                speed = excluded.speed,
                heading = excluded.heading,
                last_online_at = excluded.last_online_at,
                last_update_at = excluded.last_update_at,
                status = excluded.status
            "#,
        )
        .bind(bus_id)
        .bind(route_id)
        .bind(driver_id)
        .bind(lng)
        .bind(lat)
        .bind(speed)
        .bind(heading)
        .bind(now)
        .bind(now)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        let snapshot = self
            .fetch_snapshot(bus_id)
            .await?
            .ok_or_else(|| TrackError::StoreUnavailable(sqlx::Error::RowNotFound))?;
        self.emit(ChangeKind::Update, snapshot.clone(), now);
        Ok(snapshot)
    }

    /// Demote a bus that stopped reporting. `stale_at` is the bus's last
    /// life sign, preserved so clients can render "minutes ago" honestly.
    /// Idempotent: a second application mutates nothing and emits nothing.
    pub async fn mark_stale(
        &self,
        bus_id: &str,
        stale_at: DateTime<Utc>,
    ) -> Result<Option<BusSnapshot>, TrackError> {
        let lock = self.lock_for(bus_id).await;
        let _guard = lock.lock().await;

        let result = sqlx::query(
            r#"
            UPDATE buses
            SET online = 0, status = 'inactive', last_online_at = ?
            WHERE bus_id = ? AND online = 1
            "#,
        )
        .bind(stale_at)
        .bind(bus_id)
        .execute(&self.pool)
        .await?;

        let snapshot = self.fetch_snapshot(bus_id).await?;
        if result.rows_affected() > 0 {
            if let Some(snapshot) = snapshot.clone() {
                self.emit(ChangeKind::Stale, snapshot, Utc::now());
            }
        }
        Ok(snapshot)
    }

    pub async fn get(&self, bus_id: &str) -> Result<Option<BusSnapshot>, TrackError> {
        self.fetch_snapshot(bus_id).await
    }

    pub async fn list_online_on_route(
        &self,
        route_id: &str,
    ) -> Result<Vec<BusSnapshot>, TrackError> {
        let rows: Vec<BusRow> =
            sqlx::query_as("SELECT * FROM buses WHERE online = 1 AND route_id = ? ORDER BY bus_id")
                .bind(route_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(BusRow::into_snapshot).collect())
    }

    pub async fn list_online(&self) -> Result<Vec<BusSnapshot>, TrackError> {
        let rows: Vec<BusRow> =
            sqlx::query_as("SELECT * FROM buses WHERE online = 1 ORDER BY bus_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(BusRow::into_snapshot).collect())
    }

    /// Filtered listing for the read API. `limit` is applied as given; the
    /// HTTP layer caps it.
    pub async fn list(
        &self,
        online: Option<bool>,
        route_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<BusSnapshot>, TrackError> {
        let mut sql = String::from("SELECT * FROM buses WHERE 1=1");
        if online.is_some() {
            sql.push_str(" AND online = ?");
        }
        if route_id.is_some() {
            sql.push_str(" AND route_id = ?");
        }
        sql.push_str(" ORDER BY bus_id LIMIT ?");

        let mut query = sqlx::query_as::<_, BusRow>(&sql);
        if let Some(online) = online {
            query = query.bind(online);
        }
        if let Some(route_id) = route_id {
            query = query.bind(route_id);
        }
        let rows = query.bind(limit).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(BusRow::into_snapshot).collect())
    }

    /// Online buses whose last accepted change predates `cutoff`.
    pub async fn list_stale_candidates(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<BusSnapshot>, TrackError> {
        let rows: Vec<BusRow> =
            sqlx::query_as("SELECT * FROM buses WHERE online = 1 AND last_update_at < ?")
                .bind(cutoff)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(BusRow::into_snapshot).collect())
    }

    /// Online buses within `radius_m` metres of a point, closest first,
    /// ties broken by `bus_id`. The SQL side prefilters on an indexed
    /// bounding box; exact distances are refined in process.
    pub async fn nearby_online(
        &self,
        lng: f64,
        lat: f64,
        radius_m: f64,
        limit: usize,
    ) -> Result<Vec<(BusSnapshot, f64)>, TrackError> {
        let (min_lng, min_lat, max_lng, max_lat) = geo::bbox_around(lng, lat, radius_m);

        let rows: Vec<BusRow> = sqlx::query_as(
            r#"
            SELECT * FROM buses
            WHERE online = 1
              AND lng IS NOT NULL AND lat IS NOT NULL
              AND lng BETWEEN ? AND ?
              AND lat BETWEEN ? AND ?
            "#,
        )
        .bind(min_lng)
        .bind(max_lng)
        .bind(min_lat)
        .bind(max_lat)
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<(BusSnapshot, f64)> = rows
            .into_iter()
            .map(BusRow::into_snapshot)
            .filter_map(|bus| {
                let loc = bus.location?;
                let d = geo::haversine_m(lng, lat, loc.lng, loc.lat);
                (d <= radius_m).then_some((bus, d))
            })
            .collect();

        hits.sort_by(|(a, da), (b, db)| {
            da.partial_cmp(db)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.bus_id.cmp(&b.bus_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// The single assignment authorizing `driver_id` to report for
    /// `bus_id` at `now`. When operator error produced overlapping
    /// assignments the newest shift wins and the conflict is logged.
    pub async fn find_active_assignment(
        &self,
        driver_id: &str,
        bus_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, TrackError> {
        let rows: Vec<AssignmentRow> = sqlx::query_as(
            r#"
            SELECT * FROM assignments
            WHERE driver_id = ? AND bus_id = ? AND active = 1
              AND shift_start <= ? AND shift_end >= ?
            ORDER BY shift_start DESC
            "#,
        )
        .bind(driver_id)
        .bind(bus_id)
        .bind(now)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        if rows.len() > 1 {
            warn!(
                driver_id,
                bus_id,
                matches = rows.len(),
                "multiple active assignments cover this instant, using newest shift_start"
            );
        }

        Ok(rows.into_iter().next().map(AssignmentRow::into_assignment))
    }

    pub async fn get_driver(&self, driver_id: &str) -> Result<Option<DriverRecord>, TrackError> {
        let row: Option<DriverRecord> = sqlx::query_as(
            "SELECT driver_id, phone, role FROM drivers WHERE driver_id = ?",
        )
        .bind(driver_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_route(&self, route_id: &str) -> Result<Option<Route>, TrackError> {
        let row: Option<RouteRow> = sqlx::query_as("SELECT * FROM routes WHERE route_id = ?")
            .bind(route_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else { return Ok(None) };

        let polyline: Vec<[f64; 2]> = serde_json::from_str(&row.polyline)
            .map_err(|e| TrackError::StoreUnavailable(sqlx::Error::Decode(Box::new(e))))?;
        let stops: Vec<Stop> = serde_json::from_str(&row.stops)
            .map_err(|e| TrackError::StoreUnavailable(sqlx::Error::Decode(Box::new(e))))?;

        Ok(Some(Route {
            route_id: row.route_id,
            name: row.name,
            polyline,
            stops,
        }))
    }

    pub async fn count_buses(&self) -> Result<i64, TrackError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM buses")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
