//! Feature records
//!
//! `FeatureRecord` is the base record computed for one site: population and
//! competition per radius, size, and the home tract's raw ACS counts.
//! `ModelFeatureRecord` is the validated, derived and state-expanded vector
//! handed to the regression model, in a fixed column order.

use crate::features::radius_label;
use crate::states::State;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Home-tract attributes copied into the base record
pub const TRACT_FEATURES: [&str; 10] = [
    "median_age",
    "median_household_income",
    "per_capita_income",
    "total_population",
    "total_pop_25_plus",
    "bachelors_degree",
    "masters_degree",
    "professional_degree",
    "doctorate_degree",
    "tract_area_sqm",
];

/// Tract attributes the model cannot do without
pub const REQUIRED_TRACT_FEATURES: [&str; 7] = [
    "total_population",
    "total_pop_25_plus",
    "bachelors_degree",
    "masters_degree",
    "professional_degree",
    "doctorate_degree",
    "tract_area_sqm",
];

/// Tract attributes filled from the state median when unknown
pub const IMPUTABLE_TRACT_FEATURES: [&str; 3] =
    ["median_age", "median_household_income", "per_capita_income"];

pub fn population_feature(radius_miles: f64) -> String {
    format!("pop_{}mi", radius_label(radius_miles))
}

pub fn competitors_feature(radius_miles: f64) -> String {
    format!("competitors_{}mi", radius_label(radius_miles))
}

pub fn competitors_rate_feature(radius_miles: f64) -> String {
    format!("competitors_per_100k_{}mi", radius_label(radius_miles))
}

pub fn saturation_feature(radius_miles: f64) -> String {
    format!("saturation_{}mi", radius_label(radius_miles))
}

pub fn weighted_competition_feature(radius_miles: f64) -> String {
    format!("competition_weighted_{}mi", radius_label(radius_miles))
}

pub fn state_indicator(state: State) -> String {
    format!("is_{}", state)
}

pub fn interaction_feature(feature: &str, state: State) -> String {
    format!("{}_{}", feature, state)
}

/// Base feature record for one site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub state: State,
    pub latitude: f64,
    pub longitude: f64,
    pub census_geoid: String,
    pub tract_fetched_on_demand: bool,
    /// True when `sq_ft` is the state default
    pub size_defaulted: bool,
    /// Feature name → value; unknown tract attributes are absent
    pub values: BTreeMap<String, f64>,
}

impl FeatureRecord {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), value);
    }
}

/// Model-ready feature vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFeatureRecord {
    pub state: State,
    pub census_geoid: String,
    pub names: Vec<String>,
    pub values: Vec<f64>,
    /// Features filled from state medians
    pub imputed: Vec<String>,
}

impl ModelFeatureRecord {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|idx| self.values[idx])
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.names.iter().map(String::as_str).zip(self.values.iter().copied())
    }
}

/// Column order of the model record
///
/// The derived catchment features need the 3- and 5-mile radii and are left
/// out when those radii are not configured. Interaction features whose base
/// feature is not in the record are skipped.
pub fn model_feature_names(
    radii_miles: &[f64],
    weighted_radius_miles: f64,
    interaction_features: &[String],
) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(44);
    names.extend(radii_miles.iter().map(|&r| population_feature(r)));
    names.extend(radii_miles.iter().map(|&r| competitors_feature(r)));
    names.extend(radii_miles.iter().map(|&r| saturation_feature(r)));
    names.push(weighted_competition_feature(weighted_radius_miles));
    names.push("sq_ft".to_string());
    names.extend(TRACT_FEATURES.iter().map(|s| s.to_string()));
    names.push("population_density".to_string());
    names.push("pct_bachelor_plus".to_string());

    let has_radius = |r: f64| radii_miles.iter().any(|&x| x == r);
    if has_radius(5.0) {
        names.push("affluent_market_5mi".to_string());
    }
    names.push("educated_urban_score".to_string());
    if has_radius(3.0) {
        names.push("age_adjusted_catchment_3mi".to_string());
    }

    for state in State::ALL {
        names.push(state_indicator(state));
    }

    let base: Vec<String> = names.clone();
    for feature in interaction_features {
        if base.iter().any(|n| n == feature) {
            for state in State::ALL {
                names.push(interaction_feature(feature, state));
            }
        }
    }

    names
}

/// Stack model records into one DataFrame (one row per site) for the
/// training / prediction side
///
/// All records must share the same column order.
pub fn records_to_dataframe(records: &[ModelFeatureRecord]) -> PolarsResult<DataFrame> {
    let Some(first) = records.first() else {
        return Ok(DataFrame::empty());
    };
    if let Some(bad) = records.iter().find(|r| r.names != first.names) {
        polars_bail!(ShapeMismatch: "record for tract {} has a different feature layout", bad.census_geoid);
    }

    let mut columns: Vec<Column> = Vec::with_capacity(first.names.len() + 2);
    columns.push(Column::new(
        "state".into(),
        records.iter().map(|r| r.state.abbreviation()).collect::<Vec<_>>(),
    ));
    columns.push(Column::new(
        "census_geoid".into(),
        records.iter().map(|r| r.census_geoid.as_str()).collect::<Vec<_>>(),
    ));
    for (idx, name) in first.names.iter().enumerate() {
        let values: Vec<f64> = records.iter().map(|r| r.values[idx]).collect();
        columns.push(Column::new(name.as_str().into(), values));
    }

    DataFrame::new(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    #[test]
    fn test_canonical_model_layout_has_44_features() {
        let config = PipelineConfig::default();
        let names = model_feature_names(
            &config.radii_miles,
            config.weighted_radius_miles,
            &config.interaction_features,
        );
        assert_eq!(names.len(), 44);
        assert_eq!(names[0], "pop_1mi");
        assert_eq!(names[15], "competition_weighted_20mi");
        assert_eq!(names[16], "sq_ft");
        assert!(names.contains(&"saturation_5mi".to_string()));
        assert!(names.contains(&"median_household_income_PA".to_string()));
        assert_eq!(names.last().map(String::as_str), Some("median_household_income_PA"));

        let mut unique = names.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn test_layout_without_canonical_radii() {
        let names = model_feature_names(&[2.0, 4.0], 4.0, &["pop_5mi".to_string()]);
        assert!(!names.contains(&"affluent_market_5mi".to_string()));
        assert!(!names.contains(&"age_adjusted_catchment_3mi".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("pop_5mi_")));
        assert!(names.contains(&"competition_weighted_4mi".to_string()));
    }

    #[test]
    fn test_records_to_dataframe() {
        let record = |geoid: &str, v: f64| ModelFeatureRecord {
            state: State::FL,
            census_geoid: geoid.to_string(),
            names: vec!["pop_1mi".into(), "sq_ft".into()],
            values: vec![v, 3500.0],
            imputed: vec![],
        };
        let df = records_to_dataframe(&[record("12095016502", 100.0), record("12095016600", 200.0)])
            .unwrap();
        assert_eq!(df.shape(), (2, 4));
        let pops: Vec<Option<f64>> = df.column("pop_1mi").unwrap().f64().unwrap().into_iter().collect();
        assert_eq!(pops, vec![Some(100.0), Some(200.0)]);
    }
}
