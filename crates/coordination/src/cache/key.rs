//! Spatial cache keys.
//!
//! Coordinates are rounded to 3 decimal places (roughly 110 m of latitude) so that
//! nearby lookups share an entry.

const SCALE: f64 = 1000.0;

/// Round to 3 decimals, halves away from zero. `-0.0` normalizes to `0.0`.
pub fn round_coordinate(value: f64) -> f64 {
    let rounded = (value * SCALE).round() / SCALE;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// Cache key for a coordinate pair, e.g. `39.739:-104.990`.
pub fn coordinate_key(lat: f64, lon: f64) -> String {
    format!("{:.3}:{:.3}", round_coordinate(lat), round_coordinate(lon))
}
