//! Geodesic distance between geographic points

use geo::{GeodesicDistance, Point};

/// Geodesic (WGS84) distance in miles between two `(lat, lon)` points
pub fn geodesic_miles(a: (f64, f64), b: (f64, f64), meters_per_mile: f64) -> f64 {
    // geo points are (x = lon, y = lat)
    let pa = Point::new(a.1, a.0);
    let pb = Point::new(b.1, b.0);
    pa.geodesic_distance(&pb) / meters_per_mile
}
