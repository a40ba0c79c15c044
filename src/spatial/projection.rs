//! Albers equal-area conic projection on the GRS80 ellipsoid
//!
//! Forward projection only. Formulas follow Snyder, "Map Projections: A
//! Working Manual" (USGS PP 1395), section 14.

use geo::Coord;
use serde::{Deserialize, Serialize};

const SEMI_MAJOR_AXIS: f64 = 6_378_137.0;
const INVERSE_FLATTENING: f64 = 298.257_222_101;

/// Projection parameters in degrees / meters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlbersParams {
    /// First standard parallel
    pub lat_1: f64,
    /// Second standard parallel
    pub lat_2: f64,
    /// Latitude of origin
    pub lat_0: f64,
    /// Central meridian
    pub lon_0: f64,
    pub false_easting: f64,
    pub false_northing: f64,
}

/// Precomputed projection constants
#[derive(Debug, Clone, Copy)]
pub struct AlbersEqualArea {
    params: AlbersParams,
    e: f64,
    n: f64,
    c: f64,
    rho_0: f64,
}

impl AlbersEqualArea {
    pub fn new(params: AlbersParams) -> Self {
        let f = 1.0 / INVERSE_FLATTENING;
        let e = (2.0 * f - f * f).sqrt();

        let phi_1 = params.lat_1.to_radians();
        let phi_2 = params.lat_2.to_radians();
        let phi_0 = params.lat_0.to_radians();

        let m_1 = m(phi_1, e);
        let m_2 = m(phi_2, e);
        let q_1 = q(phi_1, e);
        let q_2 = q(phi_2, e);
        let q_0 = q(phi_0, e);

        // Tangent cone when both parallels coincide
        let n = if (phi_1 - phi_2).abs() < 1e-10 {
            phi_1.sin()
        } else {
            (m_1 * m_1 - m_2 * m_2) / (q_2 - q_1)
        };
        let c = m_1 * m_1 + n * q_1;
        let rho_0 = SEMI_MAJOR_AXIS * (c - n * q_0).max(0.0).sqrt() / n;

        Self { params, e, n, c, rho_0 }
    }

    pub fn params(&self) -> &AlbersParams {
        &self.params
    }

    /// Project geographic coordinates (degrees) to planar meters
    pub fn project(&self, latitude: f64, longitude: f64) -> Coord<f64> {
        let phi = latitude.to_radians();
        let rho = SEMI_MAJOR_AXIS * (self.c - self.n * q(phi, self.e)).max(0.0).sqrt() / self.n;
        let theta = self.n * (longitude - self.params.lon_0).to_radians();

        Coord {
            x: self.params.false_easting + rho * theta.sin(),
            y: self.params.false_northing + self.rho_0 - rho * theta.cos(),
        }
    }
}

fn m(phi: f64, e: f64) -> f64 {
    let s = phi.sin();
    phi.cos() / (1.0 - e * e * s * s).sqrt()
}

fn q(phi: f64, e: f64) -> f64 {
    let s = phi.sin();
    let e2 = e * e;
    (1.0 - e2) * (s / (1.0 - e2 * s * s) - (1.0 / (2.0 * e)) * ((1.0 - e * s) / (1.0 + e * s)).ln())
}
