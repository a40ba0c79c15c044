//! Tract Resolver
//!
//! Maps a coordinate to its census tract. A tract missing from the local
//! store is synthesised from the ACS record and the centroid table, then
//! added to the store so later radius queries see it.
//!
//! Lookup order for `resolve(state, lat, lon)`:
//! 1. coordinate cache, else geocoder (retried)
//! 2. tract store (no network)
//! 3. GEOID cache, else demographics provider (retried)
//! 4. centroid table (local, authoritative)

pub mod cache;
pub mod census_api;
pub mod retry;

use crate::config::{PipelineConfig, RetryPolicy};
use crate::data::CentroidTable;
use crate::error::{FeatureError, ProviderError};
use crate::states::{is_valid_geoid, State};
use crate::tract_store::{Tract, TractStore};
use anyhow::anyhow;
use cache::{coordinate_key, geoid_key, CachedLookup, ResolutionCache};
use census_api::{AcsRecord, DemographicsProvider, Geocoder};
use retry::retry_with_backoff;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

pub use cache::{JsonFileCache, MemoryCache};
pub use census_api::{AcsClient, CensusGeocoder, GeocodedTract};

fn upstream(service: &str, err: ProviderError) -> FeatureError {
    FeatureError::UpstreamUnavailable(format!("{}: {}", service, err))
}

fn poisoned() -> FeatureError {
    FeatureError::Data(anyhow!("tract store lock poisoned"))
}

/// Coordinate → Tract resolution with on-demand store growth
pub struct TractResolver {
    geocoder: Arc<dyn Geocoder>,
    demographics: Arc<dyn DemographicsProvider>,
    cache: Arc<dyn ResolutionCache>,
    centroids: Arc<CentroidTable>,
    retry: RetryPolicy,
    coordinate_precision: usize,
    max_age: Option<chrono::Duration>,
    /// Serialises on-demand fetches (read-then-insert on the store)
    fetch_lock: Mutex<()>,
}

impl TractResolver {
    pub fn new(
        geocoder: Arc<dyn Geocoder>,
        demographics: Arc<dyn DemographicsProvider>,
        cache: Arc<dyn ResolutionCache>,
        centroids: Arc<CentroidTable>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            geocoder,
            demographics,
            cache,
            centroids,
            retry: config.retry.clone(),
            coordinate_precision: config.coordinate_cache_precision,
            max_age: config.cache_max_age_days.map(chrono::Duration::days),
            fetch_lock: Mutex::new(()),
        }
    }

    /// Resolver backed by the live Census services, with the file cache
    /// from `cache_path` (or an in-memory cache when unset)
    pub fn from_config(config: &PipelineConfig, centroids: Arc<CentroidTable>) -> anyhow::Result<Self> {
        let cache: Arc<dyn ResolutionCache> = match &config.cache_path {
            Some(path) => Arc::new(JsonFileCache::open(path.clone())),
            None => Arc::new(MemoryCache::default()),
        };
        Ok(Self::new(
            Arc::new(CensusGeocoder::new(config)?),
            Arc::new(AcsClient::new(config)?),
            cache,
            centroids,
            config,
        ))
    }

    /// Resolve the tract containing a coordinate
    ///
    /// # Errors
    /// - `NotFound`: no tract at the coordinate, no ACS record for it, or no
    ///   reference centroid
    /// - `InvalidInput`: the tract belongs to another state
    /// - `UpstreamUnavailable`: a service failed after every retry
    pub fn resolve(
        &self,
        store: &RwLock<TractStore>,
        state: State,
        latitude: f64,
        longitude: f64,
    ) -> Result<Tract, FeatureError> {
        let geoid = self.geoid_at(latitude, longitude)?;

        if State::from_geoid(&geoid) != Some(state) {
            return Err(FeatureError::invalid(format!(
                "({}, {}) lies in tract {} outside {}",
                latitude, longitude, geoid, state
            )));
        }

        self.tract_for_geoid(store, state, &geoid)
    }

    /// Tract for a known GEOID, fetching it on demand when the store lacks it
    pub fn tract_for_geoid(
        &self,
        store: &RwLock<TractStore>,
        state: State,
        geoid: &str,
    ) -> Result<Tract, FeatureError> {
        if !is_valid_geoid(geoid) {
            return Err(FeatureError::invalid(format!("malformed GEOID '{}'", geoid)));
        }

        if let Some(tract) = store.read().map_err(|_| poisoned())?.get(geoid) {
            debug!(geoid, "Tract store hit");
            return Ok(tract.clone());
        }

        let _guard = self.fetch_lock.lock().map_err(|_| poisoned())?;

        // Another worker may have fetched it while we waited
        if let Some(tract) = store.read().map_err(|_| poisoned())?.get(geoid) {
            return Ok(tract.clone());
        }

        let tract = self.fetch_tract(state, geoid)?;
        store.write().map_err(|_| poisoned())?.add(tract.clone());
        info!(
            geoid,
            %state,
            data_complete = tract.data_complete,
            "Fetched missing tract on demand"
        );
        Ok(tract)
    }

    /// Persist the resolution cache
    pub fn flush_cache(&self) -> anyhow::Result<()> {
        self.cache.flush()
    }

    fn cached(&self, key: &str) -> Option<CachedLookup> {
        let entry = self.cache.get(key)?;
        if entry.is_expired(self.max_age) {
            debug!(key, "Cache entry expired");
            return None;
        }
        debug!(key, "Cache hit");
        Some(entry.value)
    }

    fn geoid_at(&self, latitude: f64, longitude: f64) -> Result<String, FeatureError> {
        let key = coordinate_key(latitude, longitude, self.coordinate_precision);

        match self.cached(&key) {
            Some(CachedLookup::Tract { geoid }) => return Ok(geoid),
            Some(CachedLookup::NoTract) => {
                return Err(FeatureError::not_found(format!(
                    "no census tract at ({}, {})",
                    latitude, longitude
                )))
            }
            _ => {}
        }

        let found = retry_with_backoff(&self.retry, "geocoder", || {
            self.geocoder.tract_at(latitude, longitude)
        })
        .map_err(|e| upstream("geocoder", e))?;

        match found {
            Some(tract) => {
                self.cache.put(&key, CachedLookup::Tract { geoid: tract.geoid.clone() });
                Ok(tract.geoid)
            }
            None => {
                self.cache.put(&key, CachedLookup::NoTract);
                Err(FeatureError::not_found(format!(
                    "no census tract at ({}, {})",
                    latitude, longitude
                )))
            }
        }
    }

    fn acs_record(&self, geoid: &str) -> Result<AcsRecord, FeatureError> {
        let key = geoid_key(geoid);
        let missing = || FeatureError::not_found(format!("no ACS record for tract {}", geoid));

        match self.cached(&key) {
            Some(CachedLookup::Demographics { record }) => return Ok(record),
            Some(CachedLookup::NoDemographics) => return Err(missing()),
            _ => {}
        }

        let found = retry_with_backoff(&self.retry, "ACS", || self.demographics.demographics(geoid))
            .map_err(|e| upstream("ACS", e))?;

        match found {
            Some(record) => {
                self.cache.put(&key, CachedLookup::Demographics { record: record.clone() });
                Ok(record)
            }
            None => {
                self.cache.put(&key, CachedLookup::NoDemographics);
                Err(missing())
            }
        }
    }

    fn fetch_tract(&self, state: State, geoid: &str) -> Result<Tract, FeatureError> {
        let record = self.acs_record(geoid)?;

        let reference = self.centroids.get(geoid).ok_or_else(|| {
            FeatureError::not_found(format!("no reference centroid for tract {}", geoid))
        })?;
        let area_sqm = reference.land_area_sqm.ok_or_else(|| {
            FeatureError::not_found(format!("no reference land area for tract {}", geoid))
        })?;

        Ok(Tract {
            geoid: geoid.to_string(),
            state,
            centroid: Some(reference.centroid),
            area_sqm: Some(area_sqm),
            data_complete: record.demographics.is_complete(),
            demographics: record.demographics,
            fetched_on_demand: true,
        })
    }
}
