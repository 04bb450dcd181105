//! Spherical-earth geometry helpers.

use crate::types::Coordinate;

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two coordinates in meters (haversine).
///
/// Symmetric and exactly zero for identical inputs. NaN or out-of-range
/// inputs are not checked.
pub fn distance_meters(a: Coordinate, b: Coordinate) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Rounding can push h a hair past 1 for antipodal points
    let h = h.clamp(0.0, 1.0);

    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Initial great-circle bearing from `a` to `b`, in degrees `[0, 360)`.
///
/// North is 0°, east is 90°.
pub fn bearing_degrees(a: Coordinate, b: Coordinate) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let x = d_lambda.sin() * phi2.cos();
    let y = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lambda.cos();

    x.atan2(y).to_degrees().rem_euclid(360.0)
}

/// Smallest angle between two bearings, in degrees `[0, 180]`.
pub fn bearing_change(from: f64, to: f64) -> f64 {
    let diff = (to - from).rem_euclid(360.0);
    if diff > 180.0 {
        360.0 - diff
    } else {
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(lat: f64, lon: f64) -> Coordinate {
        Coordinate::new(lat, lon)
    }

    #[test]
    fn test_distance_zero_for_identical_points() {
        let a = c(24.7136, 46.6753);
        assert_eq!(distance_meters(a, a), 0.0);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = c(51.5007, -0.1246);
        let b = c(40.6892, -74.0445);
        assert_eq!(distance_meters(a, b), distance_meters(b, a));
    }

    #[test]
    fn test_one_degree_of_latitude() {
        // 2πR / 360
        let d = distance_meters(c(0.0, 0.0), c(1.0, 0.0));
        assert!((d - 111_194.93).abs() < 1.0, "got {d}");
    }

    #[test]
    fn test_short_distances_are_monotonic() {
        let origin = c(30.0, 31.0);
        let mut last = 0.0;
        for step in 1..50 {
            let d = distance_meters(origin, c(30.0 + step as f64 * 0.0001, 31.0));
            assert!(d > last);
            last = d;
        }
        // 0.0049° of latitude ≈ 545 m
        assert!((last - 545.0).abs() < 2.0, "got {last}");
    }

    #[test]
    fn test_antipodal_points() {
        let d = distance_meters(c(0.0, 0.0), c(0.0, 180.0));
        assert!((d - std::f64::consts::PI * EARTH_RADIUS_M).abs() < 1.0);
    }

    #[test]
    fn test_cardinal_bearings() {
        let o = c(10.0, 10.0);
        assert!((bearing_degrees(o, c(11.0, 10.0)) - 0.0).abs() < 1e-9);
        assert!((bearing_degrees(o, c(9.0, 10.0)) - 180.0).abs() < 1e-9);
        assert!((bearing_degrees(c(0.0, 0.0), c(0.0, 1.0)) - 90.0).abs() < 1e-9);
        assert!((bearing_degrees(c(0.0, 0.0), c(0.0, -1.0)) - 270.0).abs() < 1e-9);
    }

    #[test]
    fn test_bearing_change_wraps() {
        assert_eq!(bearing_change(350.0, 10.0), 20.0);
        assert_eq!(bearing_change(10.0, 350.0), 20.0);
        assert_eq!(bearing_change(0.0, 180.0), 180.0);
        assert_eq!(bearing_change(90.0, 90.0), 0.0);
    }
}
