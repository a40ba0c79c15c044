//! Data Loading and Management
//!
//! Loads the static lookup tables with Polars:
//! - statewide tract demographic extract (CSV or Parquet)
//! - tract centroid/area reference table (Census Gazetteer)
//! - facility list (the competitive landscape)
//!
//! plus optional TIGER/Line tract boundaries (GeoJSON), and builds one
//! lock-guarded `TractStore` per state from them.

use crate::config::{ImputationMedians, PipelineConfig};
use crate::features::{education_percentage, population_density};
use crate::spatial::AlbersEqualArea;
use crate::states::{is_valid_geoid, Bounds, State};
use crate::tract_store::{Demographics, LatLon, Tract, TractStore};
use anyhow::{Context, Result};
use geo::{Geometry, MultiPolygon};
use geojson::{FeatureCollection, GeoJson};
use polars::prelude::*;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::path::Path;
use std::sync::RwLock;
use tracing::{info, warn};

// ============================================================================
// Column helpers
// ============================================================================

/// Normalise a GEOID string: trim and left-pad purely numeric ids to 11 digits
pub fn normalize_geoid(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.is_empty() && trimmed.len() < 11 && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        format!("{:0>11}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// ACS reports unknown values as large negative sentinel codes
/// (-666666666, -888888888, -999999999); none of the attributes can be
/// negative, so any negative or non-finite value is unknown.
pub fn clean_acs_value(value: f64) -> Option<f64> {
    (value.is_finite() && value >= 0.0).then_some(value)
}

/// GEOID column as strings, whether Polars inferred it as text or integer
fn geoid_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    let column = df
        .column(name)
        .with_context(|| format!("Column '{}' not found", name))?;

    if matches!(column.dtype(), DataType::String) {
        let values = column
            .str()
            .with_context(|| format!("Column '{}' is not string type", name))?;
        return Ok(values.into_iter().map(|v| v.map(normalize_geoid)).collect());
    }

    let ints = column
        .cast(&DataType::Int64)
        .with_context(|| format!("Column '{}' cannot be read as GEOID", name))?;
    Ok(ints
        .i64()
        .with_context(|| format!("Column '{}' is not integer type", name))?
        .into_iter()
        .map(|v| v.map(|g| format!("{:011}", g)))
        .collect())
}

/// Numeric column as f64 (integers are cast)
fn f64_column(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let column = df
        .column(name)
        .with_context(|| format!("Column '{}' not found", name))?;
    let cast = column
        .cast(&DataType::Float64)
        .with_context(|| format!("Column '{}' is not numeric", name))?;
    Ok(cast.f64()?.into_iter().collect())
}

fn optional_f64_column(df: &DataFrame, name: &str) -> Result<Option<Vec<Option<f64>>>> {
    if df.column(name).is_err() {
        return Ok(None);
    }
    f64_column(df, name).map(Some)
}

fn string_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    let column = df
        .column(name)
        .with_context(|| format!("Column '{}' not found", name))?;
    let cast = column
        .cast(&DataType::String)
        .with_context(|| format!("Column '{}' cannot be read as text", name))?;
    Ok(cast
        .str()?
        .into_iter()
        .map(|v| v.map(|s| s.trim().to_string()))
        .collect())
}

/// Boolean column; accepts native booleans, "true"/"false"/"1"/"0" text, or numbers
fn bool_column(df: &DataFrame, name: &str) -> Result<Vec<Option<bool>>> {
    let column = df
        .column(name)
        .with_context(|| format!("Column '{}' not found", name))?;

    match column.dtype() {
        DataType::Boolean => Ok(column.bool()?.into_iter().collect()),
        DataType::String => Ok(column
            .str()?
            .into_iter()
            .map(|v| {
                v.and_then(|s| match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" | "t" => Some(true),
                    "false" | "0" | "no" | "f" => Some(false),
                    _ => None,
                })
            })
            .collect()),
        _ => Ok(f64_column(df, name)?
            .into_iter()
            .map(|v| v.map(|x| x != 0.0))
            .collect()),
    }
}

fn optional_bool_column(df: &DataFrame, name: &str) -> Result<Option<Vec<Option<bool>>>> {
    if df.column(name).is_err() {
        return Ok(None);
    }
    bool_column(df, name).map(Some)
}

fn read_csv(path: &Path, separator: u8) -> Result<DataFrame> {
    CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(None)
        .map_parse_options(|opts| opts.with_separator(separator))
        .try_into_reader_with_file_path(Some(path.to_path_buf()))
        .with_context(|| format!("Failed to create CSV reader: {:?}", path))?
        .finish()
        .with_context(|| format!("Failed to load CSV: {:?}", path))
}

/// Read a table as Parquet or CSV depending on the extension
fn read_table(path: &Path) -> Result<DataFrame> {
    let is_parquet = path
        .extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case("parquet"));

    if is_parquet {
        LazyFrame::scan_parquet(path, Default::default())
            .with_context(|| format!("Failed to scan parquet: {:?}", path))?
            .collect()
            .with_context(|| format!("Failed to load parquet: {:?}", path))
    } else {
        read_csv(path, b',')
    }
}

/// Trim whitespace from header names (the Gazetteer pads its last column)
fn trim_column_names(df: &mut DataFrame) -> Result<()> {
    let names: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|n| n.to_string())
        .collect();
    for name in names {
        let trimmed = name.trim();
        if trimmed != name {
            df.rename(&name, trimmed.into())
                .with_context(|| format!("Failed to rename column '{}'", name))?;
        }
    }
    Ok(())
}

// ============================================================================
// Tract extract
// ============================================================================

/// One row of the statewide tract demographic extract
#[derive(Debug, Clone)]
pub struct ExtractRow {
    pub geoid: String,
    pub state: Option<State>,
    pub demographics: Demographics,
    pub tract_area_sqm: Option<f64>,
    pub data_complete: Option<bool>,
}

/// Load the tract demographic extract (CSV or Parquet)
pub fn load_tract_extract(path: &Path) -> Result<Vec<ExtractRow>> {
    let df = read_table(path)
        .with_context(|| format!("Failed to load tract extract: {:?}", path))?;
    extract_rows_from_dataframe(&df)
}

fn extract_rows_from_dataframe(df: &DataFrame) -> Result<Vec<ExtractRow>> {
    let geoids = geoid_column(df, "census_geoid")?;
    let state_fips = if df.column("census_state_fips").is_ok() {
        Some(string_column(df, "census_state_fips")?)
    } else {
        None
    };

    let population = f64_column(df, "total_population")?;
    let median_age = f64_column(df, "median_age")?;
    let median_income = f64_column(df, "median_household_income")?;
    let per_capita = f64_column(df, "per_capita_income")?;
    let pop_25 = f64_column(df, "total_pop_25_plus")?;
    let bachelors = f64_column(df, "bachelors_degree")?;
    let masters = f64_column(df, "masters_degree")?;
    let professional = f64_column(df, "professional_degree")?;
    let doctorate = f64_column(df, "doctorate_degree")?;
    let area = optional_f64_column(df, "tract_area_sqm")?;
    let complete = optional_bool_column(df, "census_data_complete")?;

    let clean = |v: Option<f64>| v.and_then(clean_acs_value);

    let mut rows = Vec::with_capacity(df.height());
    for idx in 0..df.height() {
        let Some(geoid) = geoids[idx].clone() else {
            continue;
        };
        if !is_valid_geoid(&geoid) {
            continue;
        }

        // GEOID prefix unless an explicit FIPS column says otherwise
        let state = state_fips
            .as_ref()
            .and_then(|fips| fips[idx].as_deref())
            .and_then(|f| State::from_fips(&format!("{:0>2}", f)))
            .or_else(|| State::from_geoid(&geoid));

        rows.push(ExtractRow {
            geoid,
            state,
            demographics: Demographics {
                total_population: clean(population[idx]),
                median_age: clean(median_age[idx]),
                median_household_income: clean(median_income[idx]),
                per_capita_income: clean(per_capita[idx]),
                total_pop_25_plus: clean(pop_25[idx]),
                bachelors_degree: clean(bachelors[idx]),
                masters_degree: clean(masters[idx]),
                professional_degree: clean(professional[idx]),
                doctorate_degree: clean(doctorate[idx]),
            },
            tract_area_sqm: area.as_ref().and_then(|a| a[idx]).filter(|a| *a > 0.0),
            data_complete: complete.as_ref().and_then(|c| c[idx]),
        });
    }

    Ok(rows)
}

// ============================================================================
// Centroid / area reference table
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CentroidEntry {
    pub centroid: LatLon,
    /// Land area (ALAND) in square meters
    pub land_area_sqm: Option<f64>,
}

/// Authoritative tract centroids and land areas, keyed by GEOID
#[derive(Debug, Default)]
pub struct CentroidTable {
    entries: FxHashMap<String, CentroidEntry>,
}

impl CentroidTable {
    /// Load a Census Gazetteer tract file
    ///
    /// Tab-separated unless the extension is `.csv`.
    pub fn load(path: &Path) -> Result<Self> {
        let is_csv = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e.eq_ignore_ascii_case("csv"));
        let mut df = read_csv(path, if is_csv { b',' } else { b'\t' })
            .with_context(|| format!("Failed to load centroid table: {:?}", path))?;
        trim_column_names(&mut df)?;

        let geoids = geoid_column(&df, "GEOID")?;
        let lats = f64_column(&df, "INTPTLAT")?;
        let lons = f64_column(&df, "INTPTLONG")?;
        let aland = optional_f64_column(&df, "ALAND")?;

        let mut entries = FxHashMap::default();
        for idx in 0..df.height() {
            if let (Some(geoid), Some(lat), Some(lon)) = (geoids[idx].clone(), lats[idx], lons[idx]) {
                entries.insert(
                    geoid,
                    CentroidEntry {
                        centroid: LatLon { lat, lon },
                        land_area_sqm: aland.as_ref().and_then(|a| a[idx]).filter(|a| *a > 0.0),
                    },
                );
            }
        }

        info!(path = ?path, entries = entries.len(), "Loaded tract centroid table");
        Ok(Self { entries })
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, CentroidEntry)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, geoid: &str) -> Option<&CentroidEntry> {
        self.entries.get(geoid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Tract boundaries
// ============================================================================

/// Property names carrying the tract GEOID in TIGER/Line exports
const BOUNDARY_GEOID_PROPERTIES: [&str; 2] = ["GEOID", "GEOID20"];

/// Load TIGER/Line tract boundaries from a GeoJSON FeatureCollection
///
/// Coordinates are WGS84 (x = lon, y = lat). Features without a GEOID or
/// without polygonal geometry are skipped.
pub fn load_tract_boundaries(path: &Path) -> Result<FxHashMap<String, MultiPolygon<f64>>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read tract boundaries: {:?}", path))?;
    let boundaries = parse_tract_boundaries(&text)
        .with_context(|| format!("Failed to parse tract boundaries: {:?}", path))?;
    info!(path = ?path, tracts = boundaries.len(), "Loaded tract boundaries");
    Ok(boundaries)
}

fn parse_tract_boundaries(text: &str) -> Result<FxHashMap<String, MultiPolygon<f64>>> {
    let geojson: GeoJson = text.parse().context("Invalid GeoJSON")?;
    let collection = FeatureCollection::try_from(geojson).context("Expected a FeatureCollection")?;

    let mut boundaries = FxHashMap::default();
    let mut skipped = 0usize;
    for feature in collection.features {
        let geoid = BOUNDARY_GEOID_PROPERTIES
            .iter()
            .find_map(|name| feature.property(name))
            .and_then(|value| match value {
                serde_json::Value::String(s) => Some(normalize_geoid(s)),
                serde_json::Value::Number(n) => n.as_u64().map(|g| format!("{:011}", g)),
                _ => None,
            })
            .filter(|g| is_valid_geoid(g));

        let shape = feature
            .geometry
            .and_then(|g| Geometry::<f64>::try_from(g.value).ok())
            .and_then(|g| match g {
                Geometry::Polygon(p) => Some(MultiPolygon::new(vec![p])),
                Geometry::MultiPolygon(mp) => Some(mp),
                _ => None,
            });

        match (geoid, shape) {
            (Some(geoid), Some(shape)) => {
                boundaries.insert(geoid, shape);
            }
            _ => skipped += 1,
        }
    }

    if skipped > 0 {
        warn!(skipped, "Boundary features without GEOID or polygon geometry skipped");
    }
    Ok(boundaries)
}

// ============================================================================
// Facilities
// ============================================================================

fn is_valid_coordinate(latitude: f64, longitude: f64) -> bool {
    (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude)
}

/// A known facility (competitor)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Facility {
    pub state: State,
    pub latitude: f64,
    pub longitude: f64,
    pub name: Option<String>,
}

/// Read-only facility list for all states
#[derive(Debug, Default)]
pub struct FacilityList {
    by_state: FxHashMap<State, Vec<Facility>>,
}

impl FacilityList {
    /// Load the facility CSV
    ///
    /// When a `has_placer_data` column exists only verified rows are kept.
    /// Rows with an unsupported state, or coordinates that are missing or
    /// outside the state's bounding box, are dropped.
    pub fn load(path: &Path, config: &PipelineConfig) -> Result<Self> {
        let df = read_csv(path, b',')
            .with_context(|| format!("Failed to load facility list: {:?}", path))?;

        let states = string_column(&df, "state")?;
        let lats = f64_column(&df, "latitude")?;
        let lons = f64_column(&df, "longitude")?;
        let names = ["name", "regulator_name", "placer_name"]
            .iter()
            .find(|c| df.column(c).is_ok())
            .map(|c| string_column(&df, c))
            .transpose()?;
        let verified = optional_bool_column(&df, "has_placer_data")?;

        let mut facilities = Vec::new();
        let mut dropped = 0usize;
        for idx in 0..df.height() {
            if let Some(flags) = verified.as_ref() {
                if flags[idx] != Some(true) {
                    continue;
                }
            }
            let state = states[idx].as_deref().and_then(|s| s.parse::<State>().ok());
            match (state, lats[idx], lons[idx]) {
                (Some(state), Some(latitude), Some(longitude))
                    if is_valid_coordinate(latitude, longitude)
                        && config.profile(state).bounds.contains(latitude, longitude) =>
                {
                    facilities.push(Facility {
                        state,
                        latitude,
                        longitude,
                        name: names.as_ref().and_then(|n| n[idx].clone()),
                    });
                }
                _ => dropped += 1,
            }
        }

        if dropped > 0 {
            warn!(dropped, "Facility rows without a supported state or in-range coordinates dropped");
        }

        let list = Self::from_facilities(facilities);
        info!(path = ?path, facilities = list.len(), "Loaded facility list");
        Ok(list)
    }

    pub fn from_facilities(facilities: impl IntoIterator<Item = Facility>) -> Self {
        let mut by_state: FxHashMap<State, Vec<Facility>> = FxHashMap::default();
        for facility in facilities {
            by_state.entry(facility.state).or_default().push(facility);
        }
        Self { by_state }
    }

    pub fn for_state(&self, state: State) -> &[Facility] {
        self.by_state.get(&state).map_or(&[], |v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.by_state.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Tract registry
// ============================================================================

fn median(name: &str, values: Vec<f64>) -> Option<f64> {
    Series::new(name.into(), values).median()
}

/// Medians of the imputable attributes over a set of tracts
///
/// Unknown values are left out; a derived feature only counts tracts where
/// it is defined (non-zero 25+ population, positive area).
pub fn tract_medians<'a>(tracts: impl IntoIterator<Item = &'a Tract>) -> ImputationMedians {
    let mut age = Vec::new();
    let mut household_income = Vec::new();
    let mut per_capita = Vec::new();
    let mut education = Vec::new();
    let mut density = Vec::new();

    for tract in tracts {
        let d = &tract.demographics;
        age.extend(d.median_age);
        household_income.extend(d.median_household_income);
        per_capita.extend(d.per_capita_income);
        education.extend(education_percentage(d));
        if let (Some(population), Some(area)) = (d.total_population, tract.area_sqm) {
            density.extend(population_density(population, area));
        }
    }

    ImputationMedians {
        median_age: median("median_age", age),
        median_household_income: median("median_household_income", household_income),
        per_capita_income: median("per_capita_income", per_capita),
        pct_bachelor_plus: median("pct_bachelor_plus", education),
        population_density: median("population_density", density),
    }
}

/// One `TractStore` per supported state, each behind its own lock, with the
/// state's imputation medians
pub struct TractRegistry {
    stores: FxHashMap<State, RwLock<TractStore>>,
    medians: FxHashMap<State, ImputationMedians>,
}

impl TractRegistry {
    /// Wrap prebuilt stores (missing states get an empty store)
    ///
    /// Imputation medians are computed over the tracts in each store, then
    /// overridden by any value set explicitly in the state's profile.
    pub fn from_stores(stores: impl IntoIterator<Item = TractStore>, config: &PipelineConfig) -> Self {
        let mut map: FxHashMap<State, RwLock<TractStore>> = stores
            .into_iter()
            .map(|s| (s.state(), RwLock::new(s)))
            .collect();
        let mut medians = FxHashMap::default();

        for state in State::ALL {
            let lock = map.entry(state).or_insert_with(|| {
                RwLock::new(TractStore::new(
                    state,
                    AlbersEqualArea::new(config.profile(state).projection),
                    config.footprint_segments,
                ))
            });
            let computed = match lock.read() {
                Ok(store) => tract_medians(store.iter()),
                Err(poisoned) => tract_medians(poisoned.into_inner().iter()),
            };
            let resolved = config.profile(state).imputation_medians.or(&computed);
            info!(%state, medians = ?resolved, "Imputation medians");
            medians.insert(state, resolved);
        }

        Self { stores: map, medians }
    }

    /// Build per-state stores from the extract and the centroid table
    ///
    /// Unpopulated tracts are removed. Tracts without a centroid (and
    /// without a boundary) stay reachable by GEOID but are not spatially
    /// indexed.
    pub fn build(rows: Vec<ExtractRow>, centroids: &CentroidTable, config: &PipelineConfig) -> Self {
        Self::build_with_boundaries(rows, centroids, FxHashMap::default(), config)
    }

    /// `build` with TIGER/Line boundaries (WGS84) keyed by GEOID
    ///
    /// A tract with a boundary gets it as its footprint, with or without a
    /// centroid; the rest get discs.
    pub fn build_with_boundaries(
        rows: Vec<ExtractRow>,
        centroids: &CentroidTable,
        boundaries: FxHashMap<String, MultiPolygon<f64>>,
        config: &PipelineConfig,
    ) -> Self {
        let mut boundaries_by_state: FxHashMap<State, FxHashMap<String, MultiPolygon<f64>>> =
            FxHashMap::default();
        for (geoid, shape) in boundaries {
            if let Some(state) = State::from_geoid(&geoid) {
                boundaries_by_state.entry(state).or_default().insert(geoid, shape);
            }
        }

        let mut per_state: FxHashMap<State, Vec<Tract>> = FxHashMap::default();
        let mut unpopulated: FxHashMap<State, usize> = FxHashMap::default();
        let mut without_centroid: FxHashMap<State, usize> = FxHashMap::default();

        for row in rows {
            let Some(state) = row.state else {
                continue;
            };
            if !row.demographics.is_populated() {
                *unpopulated.entry(state).or_default() += 1;
                continue;
            }

            let reference = centroids.get(&row.geoid);
            let has_boundary = boundaries_by_state
                .get(&state)
                .map_or(false, |b| b.contains_key(&row.geoid));
            if reference.is_none() && !has_boundary {
                *without_centroid.entry(state).or_default() += 1;
            }

            let data_complete = row
                .data_complete
                .unwrap_or_else(|| row.demographics.is_complete());

            per_state.entry(state).or_default().push(Tract {
                geoid: row.geoid,
                state,
                centroid: reference.map(|r| r.centroid),
                area_sqm: row.tract_area_sqm.or(reference.and_then(|r| r.land_area_sqm)),
                demographics: row.demographics,
                data_complete,
                fetched_on_demand: false,
            });
        }

        let mut stores = Vec::new();
        for state in State::ALL {
            let profile = config.profile(state);
            let tracts = per_state.remove(&state).unwrap_or_default();

            if let Some(removed) = unpopulated.get(&state) {
                warn!(%state, removed, "Removed tracts with zero or unknown population");
            }
            if let Some(missing) = without_centroid.get(&state) {
                warn!(%state, missing, "Tracts without a reference centroid or boundary are not spatially indexed");
            }

            let store = TractStore::from_tracts_with_boundaries(
                state,
                AlbersEqualArea::new(profile.projection),
                config.footprint_segments,
                boundaries_by_state.remove(&state).unwrap_or_default(),
                tracts,
            );

            if store.len() < profile.expected_tract_coverage {
                warn!(
                    %state,
                    tracts = store.len(),
                    expected = profile.expected_tract_coverage,
                    "Tract coverage below expectation"
                );
            }
            info!(
                %state,
                tracts = store.len(),
                indexed = store.indexed_len(),
                with_boundary = store.boundary_len(),
                "Tract store built"
            );
            stores.push(store);
        }

        Self::from_stores(stores, config)
    }

    pub fn store(&self, state: State) -> &RwLock<TractStore> {
        // Both states are always present (see from_stores)
        &self.stores[&state]
    }

    /// Medians used to impute the state's unknown attributes
    pub fn imputation_medians(&self, state: State) -> &ImputationMedians {
        &self.medians[&state]
    }
}

// ============================================================================
// Bundle
// ============================================================================

/// Everything the pipeline reads at startup
pub struct PipelineData {
    pub registry: TractRegistry,
    pub centroids: std::sync::Arc<CentroidTable>,
    pub facilities: FacilityList,
}

impl PipelineData {
    /// Load all lookup tables named in the configuration
    pub fn load(config: &PipelineConfig) -> Result<Self> {
        info!("Loading static lookup tables...");

        let rows = load_tract_extract(&config.paths.tract_extract)?;
        info!(rows = rows.len(), "Loaded tract extract");

        let centroids = CentroidTable::load(&config.paths.centroid_table)?;
        let facilities = FacilityList::load(&config.paths.facilities, config)?;
        let boundaries = match &config.paths.tract_boundaries {
            Some(path) => load_tract_boundaries(path)?,
            None => FxHashMap::default(),
        };
        let registry = TractRegistry::build_with_boundaries(rows, &centroids, boundaries, config);

        Ok(Self {
            registry,
            centroids: std::sync::Arc::new(centroids),
            facilities,
        })
    }

    pub fn summary(&self, config: &PipelineConfig) -> DataSummary {
        summarize(&self.registry, &self.facilities, config)
    }
}

/// Tract and facility counts per state
pub fn summarize(registry: &TractRegistry, facilities: &FacilityList, config: &PipelineConfig) -> DataSummary {
    let states = State::ALL
        .iter()
        .map(|&state| {
            let (tracts, indexed_tracts) = match registry.store(state).read() {
                Ok(store) => (store.len(), store.indexed_len()),
                Err(poisoned) => {
                    let store = poisoned.into_inner();
                    (store.len(), store.indexed_len())
                }
            };
            StateSummary {
                state,
                tracts,
                indexed_tracts,
                facilities: facilities.for_state(state).len(),
                bounds: config.profile(state).bounds,
            }
        })
        .collect();
    DataSummary { states }
}

/// Per-state load statistics
#[derive(Debug, Clone, Serialize)]
pub struct StateSummary {
    pub state: State,
    pub tracts: usize,
    pub indexed_tracts: usize,
    pub facilities: usize,
    pub bounds: Bounds,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataSummary {
    pub states: Vec<StateSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_normalize_geoid_pads_numeric() {
        assert_eq!(normalize_geoid("1001020100"), "01001020100");
        assert_eq!(normalize_geoid(" 12095016502 "), "12095016502");
    }

    #[test]
    fn test_sentinels_are_unknown() {
        assert_eq!(clean_acs_value(-666666666.0), None);
        assert_eq!(clean_acs_value(-999999999.0), None);
        assert_eq!(clean_acs_value(0.0), Some(0.0));
        assert_eq!(clean_acs_value(52000.0), Some(52000.0));
    }

    #[test]
    fn test_extract_rows_from_dataframe() {
        let df = df!(
            "census_geoid" => [12095016502i64, 42101000500, 12095016600],
            "total_population" => [4000.0, 3000.0, 0.0],
            "median_age" => [38.5, -666666666.0, 40.0],
            "median_household_income" => [55000.0, 61000.0, 50000.0],
            "per_capita_income" => [30000.0, 32000.0, 28000.0],
            "total_pop_25_plus" => [2800.0, 2000.0, 0.0],
            "bachelors_degree" => [500.0, 400.0, 0.0],
            "masters_degree" => [200.0, 150.0, 0.0],
            "professional_degree" => [50.0, 40.0, 0.0],
            "doctorate_degree" => [20.0, 10.0, 0.0]
        )
        .unwrap();

        let rows = extract_rows_from_dataframe(&df).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].state, Some(State::FL));
        assert_eq!(rows[1].state, Some(State::PA));
        assert_eq!(rows[1].demographics.median_age, None);
        assert_eq!(rows[0].tract_area_sqm, None);
    }

    #[test]
    fn test_registry_drops_unpopulated_and_keeps_uncentered() {
        let config = PipelineConfig::default();
        let row = |geoid: &str, pop: f64| ExtractRow {
            geoid: geoid.to_string(),
            state: State::from_geoid(geoid),
            demographics: Demographics {
                total_population: Some(pop),
                ..Default::default()
            },
            tract_area_sqm: None,
            data_complete: None,
        };
        let centroids = CentroidTable::from_entries([(
            "12095016502".to_string(),
            CentroidEntry {
                centroid: LatLon { lat: 28.5, lon: -81.3 },
                land_area_sqm: Some(2.0e6),
            },
        )]);

        let registry = TractRegistry::build(
            vec![
                row("12095016502", 4000.0),
                row("12095016600", 0.0),
                row("12095016700", 2500.0),
            ],
            &centroids,
            &config,
        );

        let store = registry.store(State::FL).read().unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.indexed_len(), 1);
        assert!(store.get("12095016600").is_none());
        assert_eq!(store.get("12095016502").unwrap().area_sqm, Some(2.0e6));
        assert!(registry.store(State::PA).read().unwrap().is_empty());
    }

    fn populated(geoid: &str, income: Option<f64>, area: f64) -> ExtractRow {
        ExtractRow {
            geoid: geoid.to_string(),
            state: State::from_geoid(geoid),
            demographics: Demographics {
                total_population: Some(1000.0),
                median_age: Some(40.0),
                median_household_income: income,
                per_capita_income: Some(30000.0),
                total_pop_25_plus: Some(800.0),
                bachelors_degree: Some(150.0),
                masters_degree: Some(40.0),
                professional_degree: Some(6.0),
                doctorate_degree: Some(4.0),
            },
            tract_area_sqm: Some(area),
            data_complete: None,
        }
    }

    #[test]
    fn test_imputation_medians_come_from_loaded_tracts() {
        let config = PipelineConfig::default();
        let rows = vec![
            populated("12095000100", Some(30000.0), 1.0e6),
            populated("12095000200", Some(40000.0), 2.0e6),
            populated("12095000300", None, 4.0e6),
            populated("12095000400", Some(40000.0), 4.0e6),
            populated("12095000500", Some(55000.0), 8.0e6),
            populated("12095000600", Some(90000.0), 16.0e6),
        ];
        let registry = TractRegistry::build(rows, &CentroidTable::default(), &config);

        let fl = registry.imputation_medians(State::FL);
        assert_eq!(fl.median_household_income, Some(40000.0));
        assert_eq!(fl.median_age, Some(40.0));
        assert_eq!(fl.per_capita_income, Some(30000.0));
        assert_relative_eq!(fl.pct_bachelor_plus.unwrap(), 25.0, max_relative = 1e-9);
        // 1,000 residents over 1, 2, 4, 4, 8 and 16 km²: the middle pair is 4 km²
        let expected_density = 1000.0 / (4.0e6 / crate::spatial::SQ_METERS_PER_SQ_MILE);
        assert_relative_eq!(fl.population_density.unwrap(), expected_density, max_relative = 1e-9);

        // No PA tracts loaded and nothing configured
        assert_eq!(registry.imputation_medians(State::PA), &ImputationMedians::default());
    }

    #[test]
    fn test_configured_median_wins() {
        let mut config = PipelineConfig::default();
        config.states.fl.imputation_medians.median_household_income = Some(61000.0);
        let rows = vec![populated("12095000100", Some(30000.0), 1.0e6)];
        let registry = TractRegistry::build(rows, &CentroidTable::default(), &config);

        let fl = registry.imputation_medians(State::FL);
        assert_eq!(fl.median_household_income, Some(61000.0));
        assert_eq!(fl.per_capita_income, Some(30000.0));
    }

    const BOUNDARIES: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            { "type": "Feature",
              "properties": { "GEOID": "12095016502", "NAMELSAD": "Census Tract 165.02" },
              "geometry": { "type": "Polygon", "coordinates": [[
                  [-81.31, 28.49], [-81.29, 28.49], [-81.29, 28.51], [-81.31, 28.51], [-81.31, 28.49]
              ]] } },
            { "type": "Feature",
              "properties": { "GEOID20": 1001020100 },
              "geometry": { "type": "MultiPolygon", "coordinates": [
                  [[[-86.5, 32.4], [-86.4, 32.4], [-86.4, 32.5], [-86.5, 32.4]]],
                  [[[-86.3, 32.4], [-86.2, 32.4], [-86.2, 32.5], [-86.3, 32.4]]]
              ] } },
            { "type": "Feature",
              "properties": { "GEOID": "42101000500" },
              "geometry": { "type": "Point", "coordinates": [-75.16, 39.95] } },
            { "type": "Feature",
              "properties": { "NAME": "no id" },
              "geometry": { "type": "Polygon", "coordinates": [[
                  [-80.0, 40.0], [-79.9, 40.0], [-79.9, 40.1], [-80.0, 40.0]
              ]] } }
        ]
    }"#;

    #[test]
    fn test_parse_tract_boundaries() {
        let boundaries = parse_tract_boundaries(BOUNDARIES).unwrap();
        assert_eq!(boundaries.len(), 2);
        assert_eq!(boundaries["12095016502"].0.len(), 1);
        // Numeric GEOIDs are zero-padded
        assert_eq!(boundaries["01001020100"].0.len(), 2);
        assert!(!boundaries.contains_key("42101000500"));
    }

    #[test]
    fn test_invalid_boundary_file_is_an_error() {
        assert!(parse_tract_boundaries("{ not json").is_err());
        assert!(parse_tract_boundaries(r#"{ "type": "Point", "coordinates": [0, 0] }"#).is_err());
    }

    #[test]
    fn test_registry_uses_loaded_boundaries() {
        let config = PipelineConfig::default();
        let path = std::env::temp_dir().join(format!(
            "site_feature_engine_boundaries_{}.geojson",
            std::process::id()
        ));
        std::fs::write(&path, BOUNDARIES).unwrap();
        let boundaries = load_tract_boundaries(&path).unwrap();
        std::fs::remove_file(&path).ok();

        // Neither tract has a centroid; only the one with a boundary is indexed
        let rows = vec![
            populated("12095016502", Some(50000.0), 4.35e6),
            populated("12095016600", Some(50000.0), 4.35e6),
        ];
        let registry =
            TractRegistry::build_with_boundaries(rows, &CentroidTable::default(), boundaries, &config);

        let store = registry.store(State::FL).read().unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.indexed_len(), 1);
        assert_eq!(store.boundary_len(), 1);

        let center = store.projection().project(28.5, -81.3);
        let overlaps = store.tracts_intersecting(&crate::spatial::equal_area_circle(center, 5000.0, 128));
        assert_eq!(overlaps.len(), 1);
        assert_eq!(overlaps[0].tract.geoid, "12095016502");
        assert_relative_eq!(overlaps[0].fraction, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_facility_load_drops_out_of_range_rows() {
        let path = std::env::temp_dir().join(format!(
            "site_feature_engine_facilities_{}.csv",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "state,latitude,longitude,name,has_placer_data\n\
             FL,28.5,-81.3,Orlando Store,true\n\
             FL,0.0,0.0,Placeholder,true\n\
             PA,95.0,-79.9,Bad Latitude,true\n\
             PA,40.4,-200.0,Bad Longitude,true\n\
             PA,28.5,-81.3,Wrong State,true\n\
             PA,40.4,-79.9,Unverified,false\n\
             PA,40.4,-79.9,Pittsburgh Store,true\n",
        )
        .unwrap();
        let list = FacilityList::load(&path, &PipelineConfig::default()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(list.len(), 2);
        assert_eq!(list.for_state(State::FL)[0].name.as_deref(), Some("Orlando Store"));
        assert_eq!(list.for_state(State::PA)[0].name.as_deref(), Some("Pittsburgh Store"));
    }

    #[test]
    fn test_facility_list_by_state() {
        let list = FacilityList::from_facilities(vec![
            Facility { state: State::FL, latitude: 28.5, longitude: -81.3, name: None },
            Facility { state: State::PA, latitude: 40.4, longitude: -79.9, name: None },
            Facility { state: State::FL, latitude: 27.9, longitude: -82.4, name: None },
        ]);
        assert_eq!(list.for_state(State::FL).len(), 2);
        assert_eq!(list.for_state(State::PA).len(), 1);
        assert_eq!(list.len(), 3);
    }

    #[test]
    #[ignore] // Requires data files to be present
    fn test_load_pipeline_data() {
        let config = PipelineConfig::from_env().expect("Failed to read config");
        let data = PipelineData::load(&config).expect("Failed to load data");
        assert!(!data.centroids.is_empty());
        assert!(!data.facilities.is_empty());
    }
}
