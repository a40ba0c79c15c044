//! Supported states
//!
//! The model is trained on Florida and Pennsylvania only. Anything else is
//! rejected up front with `InvalidInput`.

use crate::error::FeatureError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum State {
    FL,
    PA,
}

impl State {
    pub const ALL: [State; 2] = [State::FL, State::PA];

    pub fn abbreviation(&self) -> &'static str {
        match self {
            State::FL => "FL",
            State::PA => "PA",
        }
    }

    /// 2-digit state FIPS code (GEOID prefix)
    pub fn fips(&self) -> &'static str {
        match self {
            State::FL => "12",
            State::PA => "42",
        }
    }

    pub fn from_fips(fips: &str) -> Option<State> {
        State::ALL.into_iter().find(|s| s.fips() == fips)
    }

    /// State owning a GEOID, from its 2-digit prefix
    pub fn from_geoid(geoid: &str) -> Option<State> {
        geoid.get(..2).and_then(State::from_fips)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.abbreviation())
    }
}

impl FromStr for State {
    type Err = FeatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FL" => Ok(State::FL),
            "PA" => Ok(State::PA),
            other => Err(FeatureError::invalid(format!(
                "state '{}' is not supported (supported: FL, PA)",
                other
            ))),
        }
    }
}

/// Latitude/longitude bounding box used as a sanity check on input
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl Bounds {
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        (self.lat_min..=self.lat_max).contains(&latitude)
            && (self.lon_min..=self.lon_max).contains(&longitude)
    }
}

/// True when `geoid` is an 11-digit census tract identifier
pub fn is_valid_geoid(geoid: &str) -> bool {
    geoid.len() == 11 && geoid.bytes().all(|b| b.is_ascii_digit())
}
