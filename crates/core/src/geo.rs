//! Geographic coordinates attached to bikes and recipients.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// WGS84 latitude/longitude pair.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    /// Build a coordinate, rejecting values outside the valid WGS84 range.
    pub fn new(lat: f64, lon: f64) -> Result<Self, DomainError> {
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(DomainError::validation(format!("latitude out of range: {lat}")));
        }
        if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
            return Err(DomainError::validation(format!("longitude out of range: {lon}")));
        }
        Ok(Self { lat, lon })
    }
}
