use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::Coordinate;
use crate::geo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("route geometry contains no points")]
pub struct EmptyRouteError;

/// Identifies one installed route. Strictly increasing per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RouteGeneration(u64);

impl RouteGeneration {
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for RouteGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A walking route in travel order.
///
/// Immutable once built; a new destination produces a new `Route`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    points: Vec<Coordinate>,
    origin: Coordinate,
    destination: Coordinate,
    fetched_at: DateTime<Utc>,
}

impl Route {
    pub fn new(
        points: Vec<Coordinate>,
        origin: Coordinate,
        destination: Coordinate,
        fetched_at: DateTime<Utc>,
    ) -> Result<Self, EmptyRouteError> {
        if points.is_empty() {
            return Err(EmptyRouteError);
        }
        Ok(Self {
            points,
            origin,
            destination,
            fetched_at,
        })
    }

    #[must_use]
    pub fn points(&self) -> &[Coordinate] {
        &self.points
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always false; kept for API symmetry with `len`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    pub const fn origin(&self) -> Coordinate {
        self.origin
    }

    #[must_use]
    pub const fn destination(&self) -> Coordinate {
        self.destination
    }

    #[must_use]
    pub const fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Distance from `position` to the closest route vertex: `(index, meters)`.
    #[must_use]
    pub fn nearest_point(&self, position: Coordinate) -> (usize, f64) {
        // Points are non-empty by construction.
        geo::nearest_point(position, &self.points).unwrap_or((0, f64::INFINITY))
    }
}
