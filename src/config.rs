//! Pipeline configuration
//!
//! Loaded from an optional JSON file (every field has a default, so a partial
//! file is fine) with a few environment overrides:
//! - `PIPELINE_CONFIG`: path of the JSON file
//! - `DATA_DIR`: base directory for relative data paths
//! - `CENSUS_API_KEY`: ACS API key

use crate::spatial::AlbersParams;
use crate::states::{Bounds, State};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Retry behaviour for transient upstream failures
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_jitter_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), jitter excluded
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << attempt.min(16)))
    }
}

/// Minimum spacing between calls to one upstream service
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimit {
    pub min_interval_ms: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self { min_interval_ms: 200 }
    }
}

/// Upstream service endpoints
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Endpoints {
    pub geocoder_url: String,
    pub geocoder_benchmark: String,
    pub geocoder_vintage: String,
    pub acs_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            geocoder_url: "https://geocoding.geo.census.gov/geocoder/geographies/coordinates"
                .to_string(),
            geocoder_benchmark: "4".to_string(),
            geocoder_vintage: "4".to_string(),
            acs_url: "https://api.census.gov/data/2023/acs/acs5".to_string(),
        }
    }
}

/// Locations of the static lookup tables
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DataPaths {
    /// Statewide tract demographics (CSV or Parquet)
    pub tract_extract: PathBuf,
    /// Census Gazetteer tract file (centroids + land area)
    pub centroid_table: PathBuf,
    /// Known facility locations (competitive landscape)
    pub facilities: PathBuf,
    /// TIGER/Line tract boundaries as GeoJSON; tracts without one get a
    /// disc footprint
    pub tract_boundaries: Option<PathBuf>,
}

impl Default for DataPaths {
    fn default() -> Self {
        Self {
            tract_extract: PathBuf::from("data/census/intermediate/all_tracts_demographics.csv"),
            centroid_table: PathBuf::from("data/census/gazetteer/2023_Gaz_tracts_national.txt"),
            facilities: PathBuf::from(
                "data/processed/combined_with_competitive_features_corrected.csv",
            ),
            tract_boundaries: None,
        }
    }
}

/// Features the imputation stage may fill from a state median
pub const IMPUTED_MEDIAN_FEATURES: [&str; 5] = [
    "median_age",
    "median_household_income",
    "per_capita_income",
    "pct_bachelor_plus",
    "population_density",
];

/// Per-state medians for the imputation stage
///
/// In the config file every field is optional: a value set there wins,
/// anything left unset is the median over the state's loaded tracts
/// (`TractRegistry::imputation_medians`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ImputationMedians {
    pub median_age: Option<f64>,
    pub median_household_income: Option<f64>,
    pub per_capita_income: Option<f64>,
    pub pct_bachelor_plus: Option<f64>,
    pub population_density: Option<f64>,
}

impl ImputationMedians {
    /// Fields set on `self`, the rest from `computed`
    pub fn or(&self, computed: &ImputationMedians) -> ImputationMedians {
        ImputationMedians {
            median_age: self.median_age.or(computed.median_age),
            median_household_income: self.median_household_income.or(computed.median_household_income),
            per_capita_income: self.per_capita_income.or(computed.per_capita_income),
            pct_bachelor_plus: self.pct_bachelor_plus.or(computed.pct_bachelor_plus),
            population_density: self.population_density.or(computed.population_density),
        }
    }

    /// Median by feature name
    pub fn get(&self, feature: &str) -> Option<f64> {
        match feature {
            "median_age" => self.median_age,
            "median_household_income" => self.median_household_income,
            "per_capita_income" => self.per_capita_income,
            "pct_bachelor_plus" => self.pct_bachelor_plus,
            "population_density" => self.population_density,
            _ => None,
        }
    }
}

/// Everything state-specific
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateProfile {
    pub bounds: Bounds,
    pub projection: AlbersParams,
    /// Size used when the caller omits square footage
    pub default_sq_ft: f64,
    /// Tract count below which the load is logged as under-covered
    pub expected_tract_coverage: usize,
    /// Explicit overrides; empty by default
    #[serde(default)]
    pub imputation_medians: ImputationMedians,
}

impl StateProfile {
    pub fn florida() -> Self {
        Self {
            bounds: Bounds { lat_min: 24.5, lat_max: 31.0, lon_min: -87.6, lon_max: -80.0 },
            // Florida GDL Albers (EPSG:3086)
            projection: AlbersParams {
                lat_1: 24.0,
                lat_2: 31.5,
                lat_0: 24.0,
                lon_0: -84.0,
                false_easting: 400_000.0,
                false_northing: 0.0,
            },
            default_sq_ft: 3500.0,
            expected_tract_coverage: 1000,
            imputation_medians: ImputationMedians::default(),
        }
    }

    pub fn pennsylvania() -> Self {
        Self {
            bounds: Bounds { lat_min: 39.7, lat_max: 42.3, lon_min: -80.5, lon_max: -74.7 },
            projection: AlbersParams {
                lat_1: 40.0,
                lat_2: 42.0,
                lat_0: 39.0,
                lon_0: -77.75,
                false_easting: 0.0,
                false_northing: 0.0,
            },
            default_sq_ft: 4000.0,
            expected_tract_coverage: 500,
            imputation_medians: ImputationMedians::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateProfiles {
    #[serde(rename = "FL", default = "StateProfile::florida")]
    pub fl: StateProfile,
    #[serde(rename = "PA", default = "StateProfile::pennsylvania")]
    pub pa: StateProfile,
}

impl Default for StateProfiles {
    fn default() -> Self {
        Self {
            fl: StateProfile::florida(),
            pa: StateProfile::pennsylvania(),
        }
    }
}

/// Full pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Analysis radii in miles, strictly increasing
    pub radii_miles: Vec<f64>,
    pub meters_per_mile: f64,
    /// Vertices per buffer circle
    pub buffer_segments: usize,
    /// Vertices per synthesised tract footprint
    pub footprint_segments: usize,
    /// Facilities closer than this are the queried site itself
    pub self_exclusion_miles: f64,
    /// Added to distances in the inverse-distance score
    pub distance_epsilon_miles: f64,
    pub weighted_radius_miles: f64,
    pub density_ceiling_per_sq_mile: f64,
    /// Decimal places of the coordinate cache key
    pub coordinate_cache_precision: usize,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimit,
    pub request_timeout_secs: u64,
    /// On-disk resolution cache; `None` keeps the cache in memory
    pub cache_path: Option<PathBuf>,
    pub cache_max_age_days: Option<i64>,
    pub endpoints: Endpoints,
    pub paths: DataPaths,
    pub states: StateProfiles,
    /// Features expanded into `{name}_FL` / `{name}_PA`
    pub interaction_features: Vec<String>,
    #[serde(skip)]
    pub census_api_key: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            radii_miles: vec![1.0, 3.0, 5.0, 10.0, 20.0],
            meters_per_mile: 1609.34,
            buffer_segments: 128,
            footprint_segments: 48,
            self_exclusion_miles: 0.1,
            distance_epsilon_miles: 0.01,
            weighted_radius_miles: 20.0,
            density_ceiling_per_sq_mile: 100_000.0,
            coordinate_cache_precision: 6,
            retry: RetryPolicy::default(),
            rate_limit: RateLimit::default(),
            request_timeout_secs: 10,
            cache_path: Some(PathBuf::from("data/census/cache/resolution_cache.json")),
            cache_max_age_days: None,
            endpoints: Endpoints::default(),
            paths: DataPaths::default(),
            states: StateProfiles::default(),
            interaction_features: [
                "pop_5mi",
                "pop_20mi",
                "competitors_5mi",
                "saturation_5mi",
                "median_household_income",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            census_api_key: None,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline config: {:?}", path))?;

        let config: PipelineConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse pipeline config JSON: {:?}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Build configuration from the environment
    ///
    /// `PIPELINE_CONFIG` selects a JSON file (defaults otherwise), `DATA_DIR`
    /// re-roots relative data paths and `CENSUS_API_KEY` sets the ACS key.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("PIPELINE_CONFIG") {
            Ok(path) => Self::load(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        if let Ok(data_dir) = std::env::var("DATA_DIR") {
            config.rebase_paths(Path::new(&data_dir));
        }

        config.census_api_key = std::env::var("CENSUS_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());

        config.validate()?;
        Ok(config)
    }

    /// Re-root every relative data path under `base`
    pub fn rebase_paths(&mut self, base: &Path) {
        let rebase = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        rebase(&mut self.paths.tract_extract);
        rebase(&mut self.paths.centroid_table);
        rebase(&mut self.paths.facilities);
        if let Some(boundaries) = self.paths.tract_boundaries.as_mut() {
            rebase(boundaries);
        }
        if let Some(cache) = self.cache_path.as_mut() {
            rebase(cache);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.radii_miles.is_empty() {
            bail!("radii_miles must not be empty");
        }
        if self.radii_miles.iter().any(|r| !r.is_finite() || *r <= 0.0) {
            bail!("radii_miles must be positive: {:?}", self.radii_miles);
        }
        if self.radii_miles.windows(2).any(|w| w[0] >= w[1]) {
            bail!("radii_miles must be strictly increasing: {:?}", self.radii_miles);
        }
        if !(self.meters_per_mile > 0.0) {
            bail!("meters_per_mile must be positive");
        }
        if self.buffer_segments < 8 || self.footprint_segments < 8 {
            bail!("buffer_segments and footprint_segments must be at least 8");
        }
        if self.self_exclusion_miles < 0.0 || self.distance_epsilon_miles < 0.0 {
            bail!("self_exclusion_miles and distance_epsilon_miles must be non-negative");
        }
        if !(self.weighted_radius_miles > 0.0) {
            bail!("weighted_radius_miles must be positive");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        for state in State::ALL {
            let medians = &self.profile(state).imputation_medians;
            for name in IMPUTED_MEDIAN_FEATURES {
                if let Some(v) = medians.get(name) {
                    if !v.is_finite() || v < 0.0 {
                        bail!("{} imputation median for {} must be non-negative, got {}", state, name, v);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn profile(&self, state: State) -> &StateProfile {
        match state {
            State::FL => &self.states.fl,
            State::PA => &self.states.pa,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.radii_miles, vec![1.0, 3.0, 5.0, 10.0, 20.0]);
        assert_eq!(config.profile(State::FL).default_sq_ft, 3500.0);
        assert_eq!(config.profile(State::PA).default_sq_ft, 4000.0);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{ "radii_miles": [2, 4], "retry": { "max_attempts": 5 } }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.radii_miles, vec![2.0, 4.0]);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.meters_per_mile, 1609.34);
        assert_eq!(config.profile(State::PA).bounds.lat_max, 42.3);
    }

    #[test]
    fn test_non_increasing_radii_rejected() {
        let config = PipelineConfig {
            radii_miles: vec![1.0, 5.0, 3.0],
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy { max_attempts: 3, base_delay_ms: 100, max_jitter_ms: 0 };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
    }

    #[test]
    fn test_rebase_only_relative_paths() {
        let mut config = PipelineConfig::default();
        config.paths.facilities = PathBuf::from("/abs/facilities.csv");
        config.rebase_paths(Path::new("/srv/data"));
        assert_eq!(config.paths.facilities, PathBuf::from("/abs/facilities.csv"));
        assert!(config.paths.tract_extract.starts_with("/srv/data"));
        assert_eq!(config.paths.tract_boundaries, None);
    }

    #[test]
    fn test_explicit_median_overrides_computed() {
        let json = r#"{ "states": { "FL": {
            "bounds": { "lat_min": 24.5, "lat_max": 31.0, "lon_min": -87.6, "lon_max": -80.0 },
            "projection": { "lat_1": 24.0, "lat_2": 31.5, "lat_0": 24.0, "lon_0": -84.0,
                            "false_easting": 400000.0, "false_northing": 0.0 },
            "default_sq_ft": 3500.0,
            "expected_tract_coverage": 1000,
            "imputation_medians": { "median_household_income": 61000.0 }
        } } }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());

        let explicit = &config.profile(State::FL).imputation_medians;
        assert_eq!(explicit.median_household_income, Some(61000.0));
        assert_eq!(explicit.median_age, None);
        assert_eq!(config.profile(State::PA).imputation_medians, ImputationMedians::default());

        let computed = ImputationMedians {
            median_age: Some(40.0),
            median_household_income: Some(52000.0),
            ..Default::default()
        };
        let merged = explicit.or(&computed);
        assert_eq!(merged.median_household_income, Some(61000.0));
        assert_eq!(merged.median_age, Some(40.0));
        assert_eq!(merged.per_capita_income, None);
    }

    #[test]
    fn test_negative_median_rejected() {
        let mut config = PipelineConfig::default();
        config.states.pa.imputation_medians.per_capita_income = Some(-1.0);
        assert!(config.validate().is_err());
    }
}
