//! Feature Assembler - main coordinator for site feature calculation
//!
//! Runs one site through the pipeline:
//! 1. validate state and coordinates
//! 2. resolve the home tract (may grow the tract store)
//! 3. area-weighted population per radius
//! 4. competitor counts, per-100k rates, weighted score
//! 5. merge with size and tract attributes into a `FeatureRecord`
//!
//! `validate_and_expand` then turns a base record into the model-ready
//! vector. Batch analysis runs independent sites in parallel with Rayon.

use crate::config::PipelineConfig;
use crate::data::{summarize, DataSummary, FacilityList, PipelineData, TractRegistry};
use crate::error::FeatureError;
use crate::features::{
    census, education_percentage, population_density, CompetitionScorer, RadiusAggregator,
};
use crate::record::{
    competitors_feature, competitors_rate_feature, interaction_feature, model_feature_names,
    population_feature, saturation_feature, state_indicator, weighted_competition_feature,
    FeatureRecord, ModelFeatureRecord, IMPUTABLE_TRACT_FEATURES, REQUIRED_TRACT_FEATURES,
};
use crate::resolver::TractResolver;
use crate::states::State;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// One site to analyse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteQuery {
    pub state: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub sq_ft: Option<f64>,
}

/// Main feature assembler
pub struct FeatureAssembler {
    config: PipelineConfig,
    registry: TractRegistry,
    facilities: FacilityList,
    resolver: TractResolver,
    aggregator: RadiusAggregator,
    competition: CompetitionScorer,
}

impl FeatureAssembler {
    pub fn new(
        config: PipelineConfig,
        registry: TractRegistry,
        facilities: FacilityList,
        resolver: TractResolver,
    ) -> Self {
        let aggregator = RadiusAggregator::new(&config);
        let competition = CompetitionScorer::new(&config);
        Self {
            config,
            registry,
            facilities,
            resolver,
            aggregator,
            competition,
        }
    }

    /// Load static tables and connect to the live Census services
    pub fn from_config(config: PipelineConfig) -> Result<Self, FeatureError> {
        let data = PipelineData::load(&config)?;
        let resolver = TractResolver::from_config(&config, data.centroids.clone())?;
        Ok(Self::new(config, data.registry, data.facilities, resolver))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &TractRegistry {
        &self.registry
    }

    pub fn facilities(&self) -> &FacilityList {
        &self.facilities
    }

    pub fn summary(&self) -> DataSummary {
        summarize(&self.registry, &self.facilities, &self.config)
    }

    /// Persist the resolver's cache
    pub fn flush_cache(&self) -> Result<(), FeatureError> {
        self.resolver.flush_cache().map_err(FeatureError::from)
    }

    fn validate_site(
        &self,
        state: &str,
        latitude: f64,
        longitude: f64,
        sq_ft: Option<f64>,
    ) -> Result<State, FeatureError> {
        let state: State = state.parse()?;

        if !latitude.is_finite() || !longitude.is_finite() {
            return Err(FeatureError::invalid(format!(
                "coordinates must be finite numbers: ({}, {})",
                latitude, longitude
            )));
        }
        if let Some(size) = sq_ft {
            if !size.is_finite() || size <= 0.0 {
                return Err(FeatureError::invalid(format!(
                    "square footage must be a positive number, got {}",
                    size
                )));
            }
        }

        let bounds = self.config.profile(state).bounds;
        if !bounds.contains(latitude, longitude) {
            return Err(FeatureError::invalid(format!(
                "({}, {}) is outside {} bounds (lat {}..{}, lon {}..{})",
                latitude,
                longitude,
                state,
                bounds.lat_min,
                bounds.lat_max,
                bounds.lon_min,
                bounds.lon_max
            )));
        }

        Ok(state)
    }

    /// Compute the base feature record for one site
    ///
    /// # Arguments
    /// * `state` - State abbreviation (FL or PA)
    /// * `latitude`, `longitude` - Site location (WGS84 degrees)
    /// * `sq_ft` - Site size; the state default when omitted
    ///
    /// # Errors
    /// `InvalidInput` for an unsupported state, non-finite input or a point
    /// outside the state's bounds; resolver errors propagate unchanged.
    pub fn calculate_base_features(
        &self,
        state: &str,
        latitude: f64,
        longitude: f64,
        sq_ft: Option<f64>,
    ) -> Result<FeatureRecord, FeatureError> {
        let state = self.validate_site(state, latitude, longitude, sq_ft)?;
        let store = self.registry.store(state);

        let tract = self.resolver.resolve(store, state, latitude, longitude)?;

        let population = {
            let guard = store
                .read()
                .map_err(|_| FeatureError::Data(anyhow::anyhow!("tract store lock poisoned")))?;
            self.aggregator.aggregate(&guard, latitude, longitude)
        };

        let competition = self.competition.assess(
            (latitude, longitude),
            self.facilities.for_state(state),
            &population.populations(),
        );

        let profile = self.config.profile(state);
        let size_defaulted = sq_ft.is_none();
        let sq_ft = sq_ft.unwrap_or(profile.default_sq_ft);

        let mut values = BTreeMap::new();
        for (i, radius) in population.radii.iter().enumerate() {
            let r = radius.radius_miles;
            values.insert(population_feature(r), radius.population);
            values.insert(competitors_feature(r), competition.counts[i] as f64);
            values.insert(competitors_rate_feature(r), competition.rates_per_100k[i]);
        }
        values.insert(
            weighted_competition_feature(self.competition.weighted_radius_miles()),
            competition.weighted_score,
        );
        values.insert("sq_ft".to_string(), sq_ft);

        for (name, value) in tract.demographics.fields() {
            if let Some(v) = value {
                values.insert(name.to_string(), v);
            }
        }
        if let Some(area) = tract.area_sqm {
            values.insert("tract_area_sqm".to_string(), area);
        }

        info!(
            %state,
            latitude,
            longitude,
            geoid = %tract.geoid,
            fetched_on_demand = tract.fetched_on_demand,
            monotonic = population.is_monotonic,
            competitors = competition.counts.last().copied().unwrap_or(0),
            "Base features calculated"
        );

        Ok(FeatureRecord {
            state,
            latitude,
            longitude,
            census_geoid: tract.geoid,
            tract_fetched_on_demand: tract.fetched_on_demand,
            size_defaulted,
            values,
        })
    }

    /// Validate a base record and derive the model-ready feature vector
    ///
    /// Required fields must all be present; every missing one is reported.
    /// Imputation uses the state medians (computed from the loaded tracts,
    /// unless set in the config) and is limited to median age, both income
    /// fields, and the two derived features when their denominators are
    /// zero. A field that needs imputing while its state median is unknown
    /// is reported as missing.
    pub fn validate_and_expand(
        &self,
        record: &FeatureRecord,
        state: State,
    ) -> Result<ModelFeatureRecord, FeatureError> {
        if record.state != state {
            return Err(FeatureError::invalid(format!(
                "record for {} validated as {}",
                record.state, state
            )));
        }

        let radii = &self.config.radii_miles;
        let weighted_name = weighted_competition_feature(self.config.weighted_radius_miles);

        let mut required: Vec<String> = Vec::new();
        for &r in radii {
            required.push(population_feature(r));
            required.push(competitors_feature(r));
            required.push(competitors_rate_feature(r));
        }
        required.push(weighted_name.clone());
        required.push("sq_ft".to_string());
        required.extend(REQUIRED_TRACT_FEATURES.iter().map(|s| s.to_string()));

        let missing: Vec<String> = required
            .into_iter()
            .filter(|name| record.get(name).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(FeatureError::MissingFeature { missing });
        }

        let medians = self.registry.imputation_medians(state);
        let mut imputed: Vec<String> = Vec::new();
        let mut unresolved: Vec<String> = Vec::new();
        let mut features: BTreeMap<String, f64> = record.values.clone();

        let mut impute = |name: &str, imputed: &mut Vec<String>| -> Option<f64> {
            match medians.get(name) {
                Some(median) => {
                    info!(geoid = %record.census_geoid, feature = name, value = median, "Imputed from state median");
                    imputed.push(name.to_string());
                    Some(median)
                }
                None => {
                    unresolved.push(name.to_string());
                    None
                }
            }
        };

        for name in IMPUTABLE_TRACT_FEATURES {
            if features.contains_key(name) {
                continue;
            }
            if let Some(median) = impute(name, &mut imputed) {
                features.insert(name.to_string(), median);
            }
        }

        // Required fields are present past this point
        let value = |features: &BTreeMap<String, f64>, name: &str| features.get(name).copied().unwrap_or(0.0);

        let degrees = crate::tract_store::Demographics {
            total_pop_25_plus: features.get("total_pop_25_plus").copied(),
            bachelors_degree: features.get("bachelors_degree").copied(),
            masters_degree: features.get("masters_degree").copied(),
            professional_degree: features.get("professional_degree").copied(),
            doctorate_degree: features.get("doctorate_degree").copied(),
            ..Default::default()
        };
        let pct_bachelor_plus = education_percentage(&degrees)
            .or_else(|| impute("pct_bachelor_plus", &mut imputed));
        let density = population_density(
            value(&features, "total_population"),
            value(&features, "tract_area_sqm"),
        )
        .or_else(|| impute("population_density", &mut imputed));

        let (Some(pct_bachelor_plus), Some(density)) = (pct_bachelor_plus, density) else {
            return Err(FeatureError::MissingFeature { missing: unresolved });
        };
        if !unresolved.is_empty() {
            return Err(FeatureError::MissingFeature { missing: unresolved });
        }
        census::check_percentage("pct_bachelor_plus", pct_bachelor_plus);
        census::check_density(density, self.config.density_ceiling_per_sq_mile);

        features.insert("pct_bachelor_plus".to_string(), pct_bachelor_plus);
        features.insert("population_density".to_string(), density);

        for &r in radii {
            let rate = value(&features, &competitors_rate_feature(r));
            features.insert(saturation_feature(r), rate);
        }

        if let Some(pop_5) = features.get("pop_5mi").copied() {
            let income = value(&features, "median_household_income");
            features.insert("affluent_market_5mi".to_string(), pop_5 * income / 1e6);
        }
        features.insert("educated_urban_score".to_string(), pct_bachelor_plus * density);
        if let Some(pop_3) = features.get("pop_3mi").copied() {
            let age = value(&features, "median_age");
            features.insert("age_adjusted_catchment_3mi".to_string(), age * pop_3 / 1000.0);
        }

        for s in State::ALL {
            features.insert(state_indicator(s), if s == state { 1.0 } else { 0.0 });
        }
        for feature in &self.config.interaction_features {
            if let Some(v) = features.get(feature).copied() {
                for s in State::ALL {
                    let indicator = if s == state { 1.0 } else { 0.0 };
                    features.insert(interaction_feature(feature, s), v * indicator);
                }
            }
        }

        let names = model_feature_names(
            radii,
            self.config.weighted_radius_miles,
            &self.config.interaction_features,
        );
        let values: Vec<f64> = names.iter().map(|n| value(&features, n)).collect();

        debug!(geoid = %record.census_geoid, features = names.len(), imputed = imputed.len(), "Model features assembled");

        Ok(ModelFeatureRecord {
            state,
            census_geoid: record.census_geoid.clone(),
            names,
            values,
            imputed,
        })
    }

    /// Base features followed by validation and expansion
    pub fn calculate_model_features(
        &self,
        state: &str,
        latitude: f64,
        longitude: f64,
        sq_ft: Option<f64>,
    ) -> Result<ModelFeatureRecord, FeatureError> {
        let record = self.calculate_base_features(state, latitude, longitude, sq_ft)?;
        self.validate_and_expand(&record, record.state)
    }

    /// Base features for many sites in parallel, results in input order
    pub fn calculate_batch(&self, queries: &[SiteQuery]) -> Vec<Result<FeatureRecord, FeatureError>> {
        info!(sites = queries.len(), "Calculating base features in parallel");
        queries
            .par_iter()
            .map(|q| self.calculate_base_features(&q.state, q.latitude, q.longitude, q.sq_ft))
            .collect()
    }

    /// Model features for many sites in parallel, results in input order
    pub fn calculate_model_batch(
        &self,
        queries: &[SiteQuery],
    ) -> Vec<Result<ModelFeatureRecord, FeatureError>> {
        info!(sites = queries.len(), "Calculating model features in parallel");
        queries
            .par_iter()
            .map(|q| self.calculate_model_features(&q.state, q.latitude, q.longitude, q.sq_ft))
            .collect()
    }
}
