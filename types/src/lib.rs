//! Core domain types for SafeWalk.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the application.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod challenge;
mod deviation;
pub mod geo;
mod rating;
mod route;

pub use challenge::{Challenge, ChallengeId, ChallengeOutcome, TimeoutPolicy};
pub use deviation::DeviationState;
pub use rating::{Rating, SafetyAssessment};
pub use route::{EmptyRouteError, Route, RouteGeneration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Coordinates
// ============================================================================

/// Why a latitude/longitude pair was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum CoordinateError {
    #[error("latitude/longitude must be finite (got {latitude}, {longitude})")]
    NotFinite { latitude: f64, longitude: f64 },
    #[error("latitude {0} is outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} is outside [-180, 180]")]
    LongitudeOutOfRange(f64),
}

/// A validated WGS84 point in degrees.
///
/// The only way to build one is [`Coordinate::new`], so any `Coordinate`
/// in hand is finite and in range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinate")]
pub struct Coordinate {
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize)]
struct RawCoordinate {
    latitude: f64,
    longitude: f64,
}

impl TryFrom<RawCoordinate> for Coordinate {
    type Error = CoordinateError;

    fn try_from(raw: RawCoordinate) -> Result<Self, Self::Error> {
        Self::new(raw.latitude, raw.longitude)
    }
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, CoordinateError> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return Err(CoordinateError::NotFinite {
                latitude,
                longitude,
            });
        }
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(CoordinateError::LatitudeOutOfRange(latitude));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(CoordinateError::LongitudeOutOfRange(longitude));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Build from a GeoJSON `[longitude, latitude]` pair.
    pub fn from_lon_lat(pair: [f64; 2]) -> Result<Self, CoordinateError> {
        Self::new(pair[1], pair[0])
    }

    #[must_use]
    pub const fn latitude(self) -> f64 {
        self.latitude
    }

    #[must_use]
    pub const fn longitude(self) -> f64 {
        self.longitude
    }

    /// `lon,lat` as expected by the directions API query string.
    #[must_use]
    pub fn lon_lat_param(self) -> String {
        format!("{},{}", self.longitude, self.latitude)
    }

    /// Great-circle distance to `other` in meters.
    #[must_use]
    pub fn distance_to(self, other: Coordinate) -> f64 {
        geo::haversine_meters(self, other)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.5},{:.5}", self.latitude, self.longitude)
    }
}

/// An unvalidated point as handed over by a caller (map tap, CLI input).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub latitude: f64,
    pub longitude: f64,
}

impl LatLon {
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn validate(self) -> Result<Coordinate, CoordinateError> {
        Coordinate::new(self.latitude, self.longitude)
    }
}

impl From<Coordinate> for LatLon {
    fn from(value: Coordinate) -> Self {
        Self::new(value.latitude, value.longitude)
    }
}

// ============================================================================
// Positions
// ============================================================================

/// A single fix from the location platform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub coordinate: Coordinate,
    /// Horizontal accuracy radius in meters, as reported by the platform.
    pub accuracy_m: f64,
    pub captured_at: DateTime<Utc>,
}

impl Position {
    #[must_use]
    pub fn new(coordinate: Coordinate, accuracy_m: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            coordinate,
            accuracy_m,
            captured_at,
        }
    }

    /// A fix captured now.
    #[must_use]
    pub fn now(coordinate: Coordinate, accuracy_m: f64) -> Self {
        Self::new(coordinate, accuracy_m, Utc::now())
    }
}

// ============================================================================
// Identity & Secrets
// ============================================================================

#[derive(Debug, Error)]
#[error("device id must not be empty")]
pub struct EmptyDeviceIdError;

/// Stable per-install identifier sent to the backend as `uuid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(value: impl Into<String>) -> Result<Self, EmptyDeviceIdError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(EmptyDeviceIdError);
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DeviceId {
    type Error = EmptyDeviceIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceId> for String {
    fn from(value: DeviceId) -> Self {
        value.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A credential that must never reach a log line.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// Manual Debug impl to prevent leaking credentials in logs.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}
