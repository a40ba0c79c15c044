//! Planar and geodesic geometry
//!
//! Buffers and overlap areas are computed in a per-state Albers equal-area
//! projection (meters), so planar area ratios equal ground area ratios.
//! Facility distances are geodesic on the WGS84 ellipsoid.

pub mod buffer;
pub mod distance;
pub mod projection;

pub use buffer::equal_area_circle;
pub use distance::geodesic_miles;
pub use projection::{AlbersEqualArea, AlbersParams};

/// Square meters in one square mile
pub const SQ_METERS_PER_SQ_MILE: f64 = 2_589_988.110_336;
