//! Polygonal circles
//!
//! A regular n-gon inscribed in a circle of radius r has area
//! `(n/2) r² sin(2π/n)`, slightly less than `πr²`. The vertex radius is
//! scaled up so the polygon area matches the true circle exactly.

use geo::{Coord, LineString, Polygon};
use std::f64::consts::PI;

/// Vertex radius whose n-gon encloses exactly `πr²`
pub fn equal_area_vertex_radius(radius: f64, segments: usize) -> f64 {
    let n = segments as f64;
    radius * (PI / ((n / 2.0) * (2.0 * PI / n).sin())).sqrt()
}

/// Radius of the largest circle fully inside the polygon from
/// [`equal_area_circle`] (distance from center to edge midpoints)
pub fn inscribed_radius(radius: f64, segments: usize) -> f64 {
    equal_area_vertex_radius(radius, segments) * (PI / segments as f64).cos()
}

/// Polygon with `segments` vertices approximating a circle of `radius`
/// around `center`, with area equal to `πr²`
pub fn equal_area_circle(center: Coord<f64>, radius: f64, segments: usize) -> Polygon<f64> {
    let segments = segments.max(3);
    let vertex_radius = equal_area_vertex_radius(radius, segments);

    let ring: Vec<Coord<f64>> = (0..segments)
        .map(|i| {
            let angle = 2.0 * PI * i as f64 / segments as f64;
            Coord {
                x: center.x + vertex_radius * angle.cos(),
                y: center.y + vertex_radius * angle.sin(),
            }
        })
        .collect();

    // LineString closes itself when wrapped in a Polygon
    Polygon::new(LineString::from(ring), vec![])
}

/// Radius of a circle with the given area
pub fn radius_for_area(area: f64) -> f64 {
    (area.max(0.0) / PI).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use geo::Area;

    #[test]
    fn test_circle_area_matches_pi_r_squared() {
        for segments in [16, 48, 128] {
            let poly = equal_area_circle(Coord { x: 1000.0, y: -500.0 }, 8046.7, segments);
            assert_relative_eq!(poly.unsigned_area(), PI * 8046.7 * 8046.7, max_relative = 1e-9);
        }
    }

    #[test]
    fn test_inscribed_radius_is_inside() {
        let r = 1609.34;
        let inner = inscribed_radius(r, 128);
        assert!(inner < equal_area_vertex_radius(r, 128));
        // Within a tenth of a percent of the nominal radius
        assert!(inner > r * 0.999);
    }

    #[test]
    fn test_radius_for_area_round_trip() {
        assert_relative_eq!(radius_for_area(PI * 25.0), 5.0, epsilon = 1e-12);
        assert_eq!(radius_for_area(-1.0), 0.0);
    }
}
