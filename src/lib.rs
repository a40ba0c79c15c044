//! Site Feature Engine
//!
//! Geospatial feature engineering for retail visit estimation in Florida
//! and Pennsylvania. A (state, latitude, longitude, size) query becomes a
//! fixed-width numeric feature vector:
//! - `tract_store/`: per-state census tracts with an R-tree index
//! - `resolver/`: coordinate → tract, with on-demand ACS fetch and caching
//! - `features/`: area-weighted population, competition, derived census features
//! - `assembler`: orchestration, validation and state expansion
//!
//! Static tables (tract extract, Gazetteer centroids, facility list) are
//! loaded with Polars at startup.

pub mod assembler;
pub mod config;
pub mod data;
pub mod error;
pub mod features;
pub mod record;
pub mod resolver;
pub mod spatial;
pub mod states;
pub mod tract_store;

// Re-export commonly used types
pub use assembler::{FeatureAssembler, SiteQuery};
pub use config::{ImputationMedians, PipelineConfig, StateProfile};
pub use data::{CentroidEntry, CentroidTable, DataSummary, Facility, FacilityList, PipelineData, TractRegistry};
pub use error::{FeatureError, ProviderError};
pub use features::{rate_per_100k, CompetitionScorer, RadiusAggregator};
pub use record::{model_feature_names, records_to_dataframe, FeatureRecord, ModelFeatureRecord};
pub use resolver::cache::{CachedLookup, MemoryCache, ResolutionCache};
pub use resolver::census_api::{AcsRecord, DemographicsProvider, GeocodedTract, Geocoder};
pub use resolver::TractResolver;
pub use states::State;
pub use tract_store::{Demographics, LatLon, Tract, TractStore};
