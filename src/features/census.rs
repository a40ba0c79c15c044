//! Derived census features
//!
//! Raw ACS counts are turned into the two secondary features the model
//! uses. Values outside the plausible range are logged, never rejected.

use crate::spatial::SQ_METERS_PER_SQ_MILE;
use crate::tract_store::Demographics;
use tracing::warn;

/// Share of the 25+ population holding a bachelor's degree or higher (0-100)
///
/// `None` when the 25+ population is unknown or zero, or any degree count
/// is unknown.
pub fn education_percentage(demographics: &Demographics) -> Option<f64> {
    let pop_25_plus = demographics.total_pop_25_plus.filter(|p| *p > 0.0)?;
    let degree_holders = demographics.bachelors_degree?
        + demographics.masters_degree?
        + demographics.professional_degree?
        + demographics.doctorate_degree?;
    Some(degree_holders / pop_25_plus * 100.0)
}

/// Residents per square mile; `None` when the area is not positive
pub fn population_density(population: f64, area_sqm: f64) -> Option<f64> {
    (area_sqm > 0.0).then(|| population / (area_sqm / SQ_METERS_PER_SQ_MILE))
}

/// Logs a warning when a percentage falls outside [0, 100]
pub fn check_percentage(name: &str, value: f64) -> bool {
    let ok = (0.0..=100.0).contains(&value);
    if !ok {
        warn!(feature = name, value, "Percentage outside [0, 100]");
    }
    ok
}

/// Logs a warning when a density falls outside [0, ceiling]
pub fn check_density(value: f64, ceiling: f64) -> bool {
    let ok = (0.0..=ceiling).contains(&value);
    if !ok {
        warn!(value, ceiling, "Population density outside plausible range");
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn demographics() -> Demographics {
        Demographics {
            total_pop_25_plus: Some(2000.0),
            bachelors_degree: Some(400.0),
            masters_degree: Some(150.0),
            professional_degree: Some(30.0),
            doctorate_degree: Some(20.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_education_percentage() {
        assert_relative_eq!(education_percentage(&demographics()).unwrap(), 30.0);
    }

    #[test]
    fn test_education_percentage_zero_base() {
        let mut d = demographics();
        d.total_pop_25_plus = Some(0.0);
        assert_eq!(education_percentage(&d), None);
        d.total_pop_25_plus = Some(2000.0);
        d.doctorate_degree = None;
        assert_eq!(education_percentage(&d), None);
    }

    #[test]
    fn test_population_density_per_square_mile() {
        assert_relative_eq!(
            population_density(5000.0, SQ_METERS_PER_SQ_MILE * 2.0).unwrap(),
            2500.0
        );
        assert_eq!(population_density(5000.0, 0.0), None);
    }

    #[test]
    fn test_range_checks() {
        assert!(check_percentage("pct_bachelor_plus", 45.0));
        assert!(!check_percentage("pct_bachelor_plus", 120.0));
        assert!(check_density(3000.0, 100_000.0));
        assert!(!check_density(250_000.0, 100_000.0));
    }
}
