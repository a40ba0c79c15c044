//! Feature calculators
//!
//! Each calculator owns one family of features:
//! - population: area-weighted population per radius
//! - competition: facility counts, per-100k rates and distance-weighted score
//! - census: derived demographic features (education %, density)

pub mod census;
pub mod competition;
pub mod population;

pub use census::{education_percentage, population_density};
pub use competition::{rate_per_100k, CompetitionResult, CompetitionScorer};
pub use population::{PopulationResult, RadiusAggregator, RadiusPopulation};

/// Feature-name fragment for a radius: `5` for 5.0, `2.5` for 2.5
pub fn radius_label(radius_miles: f64) -> String {
    if radius_miles.fract() == 0.0 {
        format!("{}", radius_miles as i64)
    } else {
        format!("{}", radius_miles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radius_label() {
        assert_eq!(radius_label(5.0), "5");
        assert_eq!(radius_label(20.0), "20");
        assert_eq!(radius_label(2.5), "2.5");
    }
}
