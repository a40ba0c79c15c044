//! Radius Aggregator - area-weighted population within circular buffers
//!
//! For each configured radius the center is buffered by an equal-area
//! circle in the state's projection and every intersecting tract
//! contributes `population × (intersection area / tract area)`.
//!
//! Radii are evaluated independently against the full tract set (no
//! incremental rings), so each value stands on its own. Larger buffers are
//! supersets of smaller ones; a decrease across radii means bad data or a
//! projection bug and is logged.

use crate::config::PipelineConfig;
use crate::error::FeatureError;
use crate::spatial::equal_area_circle;
use crate::tract_store::TractStore;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Population within one radius
#[derive(Debug, Clone, Serialize)]
pub struct RadiusPopulation {
    pub radius_miles: f64,
    /// Area-weighted population
    pub population: f64,
    /// Tracts with a non-zero overlap
    pub tract_count: usize,
    /// GEOID → fraction of the tract inside the buffer
    pub tract_weights: BTreeMap<String, f64>,
}

/// Result of a multi-radius aggregation
#[derive(Debug, Clone, Serialize)]
pub struct PopulationResult {
    pub radii: Vec<RadiusPopulation>,
    /// False when some larger radius has less population than a smaller one
    pub is_monotonic: bool,
}

impl PopulationResult {
    pub fn populations(&self) -> Vec<f64> {
        self.radii.iter().map(|r| r.population).collect()
    }

    pub fn population_at(&self, radius_miles: f64) -> Option<f64> {
        self.radii
            .iter()
            .find(|r| r.radius_miles == radius_miles)
            .map(|r| r.population)
    }
}

pub struct RadiusAggregator {
    radii_miles: Vec<f64>,
    meters_per_mile: f64,
    segments: usize,
}

impl RadiusAggregator {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            radii_miles: config.radii_miles.clone(),
            meters_per_mile: config.meters_per_mile,
            segments: config.buffer_segments,
        }
    }

    /// Aggregator for an explicit radius set
    ///
    /// # Errors
    /// `InvalidInput` unless the radii are positive and strictly increasing.
    pub fn with_radii(
        radii_miles: Vec<f64>,
        meters_per_mile: f64,
        segments: usize,
    ) -> Result<Self, FeatureError> {
        if radii_miles.is_empty()
            || radii_miles.iter().any(|r| !r.is_finite() || *r <= 0.0)
            || radii_miles.windows(2).any(|w| w[0] >= w[1])
        {
            return Err(FeatureError::invalid(format!(
                "radii must be positive and strictly increasing: {:?}",
                radii_miles
            )));
        }
        Ok(Self {
            radii_miles,
            meters_per_mile,
            segments,
        })
    }

    pub fn radii(&self) -> &[f64] {
        &self.radii_miles
    }

    /// Area-weighted population within `radius_miles` of a coordinate
    pub fn population_within(
        &self,
        store: &TractStore,
        latitude: f64,
        longitude: f64,
        radius_miles: f64,
    ) -> RadiusPopulation {
        let center = store.projection().project(latitude, longitude);
        let buffer = equal_area_circle(center, radius_miles * self.meters_per_mile, self.segments);

        let mut population = 0.0;
        let mut tract_weights = BTreeMap::new();

        for overlap in store.tracts_intersecting(&buffer) {
            // Unknown population contributes nothing without spoiling the sum
            let tract_population = overlap.tract.demographics.total_population.unwrap_or(0.0);
            population += tract_population * overlap.fraction;
            tract_weights.insert(overlap.tract.geoid.clone(), overlap.fraction);
        }

        debug!(
            radius_miles,
            population,
            tracts = tract_weights.len(),
            "Radius population"
        );

        RadiusPopulation {
            radius_miles,
            population,
            tract_count: tract_weights.len(),
            tract_weights,
        }
    }

    /// Population at every configured radius
    pub fn aggregate(&self, store: &TractStore, latitude: f64, longitude: f64) -> PopulationResult {
        let radii: Vec<RadiusPopulation> = self
            .radii_miles
            .iter()
            .map(|&r| self.population_within(store, latitude, longitude, r))
            .collect();

        let mut is_monotonic = true;
        for pair in radii.windows(2) {
            let (inner, outer) = (&pair[0], &pair[1]);
            // Tolerate floating-point noise from polygon clipping
            let tolerance = 1e-9 * inner.population.abs().max(1.0);
            if outer.population + tolerance < inner.population {
                is_monotonic = false;
                warn!(
                    latitude,
                    longitude,
                    inner_radius = inner.radius_miles,
                    inner_population = inner.population,
                    outer_radius = outer.radius_miles,
                    outer_population = outer.population,
                    "Population decreases with radius"
                );
            }
        }

        PopulationResult { radii, is_monotonic }
    }
}
