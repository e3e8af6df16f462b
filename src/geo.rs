//! Great-circle geometry helpers for position streams.

use crate::model::VehiclePosition;

/// Mean Earth radius in metres (IUGG).
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two WGS-84 points, in metres.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_M * c
}

/// Instantaneous speed in km/h between two timestamped positions.
///
/// Returns `None` when the timestamps are equal (or inverted): no elapsed
/// time means no speed, and the caller must make no stop decision that tick.
pub fn speed_kmh(newer: &VehiclePosition, older: &VehiclePosition) -> Option<f64> {
    let elapsed = (newer.observed_at - older.observed_at).num_milliseconds();
    if elapsed <= 0 {
        return None;
    }

    let metres = haversine_m(older.lat, older.lon, newer.lat, newer.lon);
    let metres_per_sec = metres / (elapsed as f64 / 1000.0);
    Some(metres_per_sec * 3.6)
}
