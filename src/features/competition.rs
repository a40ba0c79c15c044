//! Competition Scorer - competitor density around a site
//!
//! Distances are geodesic (WGS84) miles, computed once per query and reused
//! for every radius and the weighted score. A facility closer than the
//! self-exclusion distance is the queried site itself and never counts.

use crate::config::PipelineConfig;
use crate::data::Facility;
use crate::spatial::geodesic_miles;
use serde::Serialize;

/// Competitors per 100,000 residents; 0 when population is not positive
pub fn rate_per_100k(count: usize, population: f64) -> f64 {
    if population > 0.0 {
        count as f64 / population * 100_000.0
    } else {
        0.0
    }
}

/// Result of a competition assessment
#[derive(Debug, Clone, Serialize)]
pub struct CompetitionResult {
    pub radii_miles: Vec<f64>,
    /// Competitor count per radius
    pub counts: Vec<usize>,
    /// Competitors per 100k residents per radius
    pub rates_per_100k: Vec<f64>,
    /// Σ 1 / (distance + ε) within the weighted radius
    pub weighted_score: f64,
}

pub struct CompetitionScorer {
    radii_miles: Vec<f64>,
    self_exclusion_miles: f64,
    distance_epsilon_miles: f64,
    weighted_radius_miles: f64,
    meters_per_mile: f64,
}

impl CompetitionScorer {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            radii_miles: config.radii_miles.clone(),
            self_exclusion_miles: config.self_exclusion_miles,
            distance_epsilon_miles: config.distance_epsilon_miles,
            weighted_radius_miles: config.weighted_radius_miles,
            meters_per_mile: config.meters_per_mile,
        }
    }

    pub fn weighted_radius_miles(&self) -> f64 {
        self.weighted_radius_miles
    }

    /// Distances (miles) from `center` to every facility, self excluded
    fn competitor_distances(&self, center: (f64, f64), facilities: &[Facility]) -> Vec<f64> {
        facilities
            .iter()
            .map(|f| geodesic_miles(center, (f.latitude, f.longitude), self.meters_per_mile))
            .filter(|d| *d > self.self_exclusion_miles)
            .collect()
    }

    fn count_within(distances: &[f64], radius_miles: f64) -> usize {
        distances.iter().filter(|d| **d <= radius_miles).count()
    }

    fn score_within(&self, distances: &[f64], radius_miles: f64) -> f64 {
        distances
            .iter()
            .filter(|d| **d <= radius_miles)
            .map(|d| 1.0 / (d + self.distance_epsilon_miles))
            .sum()
    }

    /// Competitor count at each configured radius, as `(radius, count)`
    pub fn counts_by_radius(&self, center: (f64, f64), facilities: &[Facility]) -> Vec<(f64, usize)> {
        let distances = self.competitor_distances(center, facilities);
        self.radii_miles
            .iter()
            .map(|&r| (r, Self::count_within(&distances, r)))
            .collect()
    }

    /// Inverse-distance competition score within `radius_miles`
    pub fn weighted_score(&self, center: (f64, f64), facilities: &[Facility], radius_miles: f64) -> f64 {
        let distances = self.competitor_distances(center, facilities);
        self.score_within(&distances, radius_miles)
    }

    /// Counts, per-100k rates and weighted score in one pass
    ///
    /// `populations` holds the population at each configured radius.
    pub fn assess(
        &self,
        center: (f64, f64),
        facilities: &[Facility],
        populations: &[f64],
    ) -> CompetitionResult {
        let distances = self.competitor_distances(center, facilities);

        let counts: Vec<usize> = self
            .radii_miles
            .iter()
            .map(|&r| Self::count_within(&distances, r))
            .collect();

        let rates_per_100k = counts
            .iter()
            .enumerate()
            .map(|(i, &count)| rate_per_100k(count, populations.get(i).copied().unwrap_or(0.0)))
            .collect();

        CompetitionResult {
            radii_miles: self.radii_miles.clone(),
            counts,
            rates_per_100k,
            weighted_score: self.score_within(&distances, self.weighted_radius_miles),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::State;
    use approx::assert_relative_eq;

    const CENTER: (f64, f64) = (28.5685, -81.2163);

    fn facility(lat: f64, lon: f64) -> Facility {
        Facility { state: State::FL, latitude: lat, longitude: lon, name: None }
    }

    fn scorer() -> CompetitionScorer {
        CompetitionScorer::new(&PipelineConfig::default())
    }

    #[test]
    fn test_rate_per_100k_zero_population() {
        assert_eq!(rate_per_100k(3, 0.0), 0.0);
        assert_eq!(rate_per_100k(0, 0.0), 0.0);
        assert_relative_eq!(rate_per_100k(2, 50_000.0), 4.0);
    }

    #[test]
    fn test_self_is_excluded() {
        let facilities = vec![facility(CENTER.0, CENTER.1)];
        let counts = scorer().counts_by_radius(CENTER, &facilities);
        assert!(counts.iter().all(|(_, c)| *c == 0));
        assert_eq!(scorer().weighted_score(CENTER, &facilities, 20.0), 0.0);
    }

    #[test]
    fn test_empty_list() {
        let result = scorer().assess(CENTER, &[], &[0.0; 5]);
        assert_eq!(result.counts, vec![0; 5]);
        assert_eq!(result.rates_per_100k, vec![0.0; 5]);
        assert_eq!(result.weighted_score, 0.0);
    }

    #[test]
    fn test_counts_are_cumulative() {
        // ~0.5, ~2.1 and ~8.3 miles north
        let facilities = vec![
            facility(CENTER.0 + 0.0072, CENTER.1),
            facility(CENTER.0 + 0.030, CENTER.1),
            facility(CENTER.0 + 0.120, CENTER.1),
        ];
        let counts: Vec<usize> = scorer()
            .counts_by_radius(CENTER, &facilities)
            .into_iter()
            .map(|(_, c)| c)
            .collect();
        assert_eq!(counts, vec![1, 2, 2, 3, 3]);
    }

    #[test]
    fn test_weighted_score_matches_formula() {
        let near = facility(CENTER.0 + 0.0072, CENTER.1);
        let d = geodesic_miles(CENTER, (near.latitude, near.longitude), 1609.34);
        let score = scorer().weighted_score(CENTER, &[near], 20.0);
        assert_relative_eq!(score, 1.0 / (d + 0.01), max_relative = 1e-12);
    }

    #[test]
    fn test_facility_beyond_weighted_radius_is_ignored() {
        // ~25 miles north, past every radius
        let far = facility(CENTER.0 + 0.3625, CENTER.1);
        let d = geodesic_miles(CENTER, (far.latitude, far.longitude), 1609.34);
        assert!(d > 20.0);

        let facilities = vec![far];
        assert!(scorer().counts_by_radius(CENTER, &facilities).iter().all(|(_, c)| *c == 0));
        assert_eq!(scorer().weighted_score(CENTER, &facilities, 20.0), 0.0);

        let result = scorer().assess(CENTER, &facilities, &[1e4, 1e5, 2e5, 5e5, 1e6]);
        assert_eq!(result.counts, vec![0; 5]);
        assert_eq!(result.weighted_score, 0.0);

        // The same facility counts once the radius reaches it
        assert_relative_eq!(
            scorer().weighted_score(CENTER, &facilities, 30.0),
            1.0 / (d + 0.01),
            max_relative = 1e-12
        );
    }

    #[test]
    fn test_facility_exactly_at_radius_is_included() {
        let edge = facility(CENTER.0 + 0.0725, CENTER.1);
        let d = geodesic_miles(CENTER, (edge.latitude, edge.longitude), 1609.34);

        let config = PipelineConfig {
            radii_miles: vec![1.0, d],
            weighted_radius_miles: d,
            ..PipelineConfig::default()
        };
        let scorer = CompetitionScorer::new(&config);
        let facilities = vec![edge];

        assert_eq!(scorer.counts_by_radius(CENTER, &facilities), vec![(1.0, 0), (d, 1)]);
        assert_relative_eq!(
            scorer.weighted_score(CENTER, &facilities, d),
            1.0 / (d + 0.01),
            max_relative = 1e-12
        );
        assert_eq!(scorer.assess(CENTER, &facilities, &[0.0, 0.0]).counts, vec![0, 1]);

        // Just inside the facility's distance it drops out
        let inside = d * (1.0 - 1e-9);
        assert_eq!(scorer.weighted_score(CENTER, &facilities, inside), 0.0);
    }

    #[test]
    fn test_assess_rates_use_radius_population() {
        let facilities = vec![facility(CENTER.0 + 0.0072, CENTER.1)];
        let result = scorer().assess(CENTER, &facilities, &[10_000.0, 50_000.0, 0.0, 1e5, 2e5]);
        assert_relative_eq!(result.rates_per_100k[0], 10.0);
        assert_relative_eq!(result.rates_per_100k[1], 2.0);
        assert_eq!(result.rates_per_100k[2], 0.0);
    }
}
