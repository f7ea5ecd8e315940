//! Great-circle arithmetic shared by the throttle, the nearby query and
//! the ETA worker.

/// Earth radius used for all distance computations, in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two (lng, lat) positions, in metres.
pub fn haversine_m(lng1: f64, lat1: f64, lng2: f64, lat2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_M * c
}

pub fn valid_lng(lng: f64) -> bool {
    lng.is_finite() && (-180.0..=180.0).contains(&lng)
}

pub fn valid_lat(lat: f64) -> bool {
    lat.is_finite() && (-90.0..=90.0).contains(&lat)
}

pub fn valid_coord(lng: f64, lat: f64) -> bool {
    valid_lng(lng) && valid_lat(lat)
}

/// Bounding box around a centre point that is guaranteed to contain the
/// circle of `radius_m` metres. Used as an index-friendly prefilter; exact
/// distances are refined with [`haversine_m`] afterwards.
///
/// Returns `(min_lng, min_lat, max_lng, max_lat)`.
pub fn bbox_around(lng: f64, lat: f64, radius_m: f64) -> (f64, f64, f64, f64) {
    let lat_delta = (radius_m / EARTH_RADIUS_M).to_degrees();
    // Longitude degrees shrink with latitude; clamp the cosine away from
    // zero so polar queries degrade to a full-longitude scan instead of
    // dividing by zero.
    let lng_delta = lat_delta / lat.to_radians().cos().max(0.01);

    (
        (lng - lng_delta).max(-180.0),
        (lat - lat_delta).max(-90.0),
        (lng + lng_delta).min(180.0),
        (lat + lat_delta).min(90.0),
    )
}
