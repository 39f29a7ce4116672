//! Great-circle geometry.
//!
//! Proximity to a route is measured point-to-point: the distance from a fix
//! to each route vertex, never to the segments between them. Sparse
//! polylines therefore over-report deviation between distant vertices.

use crate::Coordinate;

/// Mean Earth radius used by the haversine formula, in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Haversine distance between two coordinates, in meters.
#[must_use]
pub fn haversine_meters(from: Coordinate, to: Coordinate) -> f64 {
    let lat1 = from.latitude().to_radians();
    let lat2 = to.latitude().to_radians();
    let d_lat = (to.latitude() - from.latitude()).to_radians();
    let d_lon = (to.longitude() - from.longitude()).to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_METERS * c
}

/// Nearest vertex to `from`: `(index, distance_m)`. `None` for no points.
#[must_use]
pub fn nearest_point(from: Coordinate, points: &[Coordinate]) -> Option<(usize, f64)> {
    points
        .iter()
        .map(|point| haversine_meters(from, *point))
        .enumerate()
        .min_by(|(_, a), (_, b)| a.total_cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(lat: f64, lon: f64) -> Coordinate {
        Coordinate::new(lat, lon).unwrap()
    }

    #[test]
    fn zero_distance_to_self() {
        let p = c(37.7749, -122.4194);
        assert_eq!(haversine_meters(p, p), 0.0);
    }

    #[test]
    fn one_degree_of_latitude_is_about_111_km() {
        let d = haversine_meters(c(0.0, 0.0), c(1.0, 0.0));
        assert!((d - 111_194.9).abs() < 1.0, "got {d}");
    }

    #[test]
    fn distance_is_symmetric() {
        let a = c(51.5007, -0.1246);
        let b = c(40.6892, -74.0445);
        let ab = haversine_meters(a, b);
        let ba = haversine_meters(b, a);
        assert!((ab - ba).abs() < 1e-6);
        // London to New York is roughly 5,575 km.
        assert!((ab / 1000.0 - 5575.0).abs() < 10.0, "got {ab}");
    }

    #[test]
    fn nearest_point_picks_minimum() {
        let points = [c(0.0, 0.0), c(0.0, 0.001), c(0.0, 0.002)];
        let (index, distance) = nearest_point(c(0.0, 0.0019), &points).unwrap();
        assert_eq!(index, 2);
        assert!(distance < 20.0);
        assert!(nearest_point(c(0.0, 0.0), &[]).is_none());
    }
}
