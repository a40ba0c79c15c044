//! Error taxonomy for the feature pipeline
//!
//! Every failure a caller can act on has its own variant. The pipeline never
//! turns one of these into a default value: a site that cannot be analysed
//! surfaces as an error, not as a record full of zeros.

use thiserror::Error;

/// Errors surfaced by the feature pipeline
#[derive(Debug, Error)]
pub enum FeatureError {
    /// Unsupported state, coordinates outside the state's bounding box, or
    /// malformed numeric input. Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Geocoding or demographic lookup found nothing for the input
    /// (coordinate over water, tract without an ACS record, tract without a
    /// reference centroid). The site cannot be analysed.
    #[error("not found: {0}")]
    NotFound(String),

    /// An external service stayed unreachable or rate-limited after every
    /// retry. The caller may try again later.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The assembled record lacks fields the downstream model requires
    #[error("missing required features: {}", .missing.join(", "))]
    MissingFeature { missing: Vec<String> },

    /// Static data could not be loaded (missing file, missing column)
    #[error("data error: {0:#}")]
    Data(#[from] anyhow::Error),
}

impl FeatureError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        FeatureError::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        FeatureError::NotFound(msg.into())
    }
}

/// Failure reported by an upstream client (geocoder, demographics API)
///
/// Absence of data is not a `ProviderError`: clients return `Ok(None)` for a
/// tract that genuinely does not exist.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Timeout, connection failure, HTTP 429 or 5xx. Worth retrying.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Any other failure (bad request, unauthorised, unparseable body)
    #[error("upstream failure: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}
