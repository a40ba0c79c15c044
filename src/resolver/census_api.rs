//! Census geocoder and ACS demographics clients
//!
//! Both services sit behind a trait so the resolver can be driven by fakes
//! in tests. The HTTP implementations classify every failure:
//! - `Ok(None)`: the service answered and there is genuinely nothing
//! - `ProviderError::Transient`: timeout, connection failure, 429, 5xx
//! - `ProviderError::Fatal`: anything else (4xx, unparseable body)

use crate::config::PipelineConfig;
use crate::data::clean_acs_value;
use crate::error::ProviderError;
use crate::resolver::retry::RateLimiter;
use crate::tract_store::Demographics;
use anyhow::{Context, Result};
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Tract returned by the geocoder for a coordinate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeocodedTract {
    pub geoid: String,
    pub name: Option<String>,
}

/// ACS 5-year attributes of one tract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcsRecord {
    pub geoid: String,
    pub name: Option<String>,
    pub demographics: Demographics,
}

/// Coordinate → tract
pub trait Geocoder: Send + Sync {
    fn tract_at(&self, latitude: f64, longitude: f64) -> Result<Option<GeocodedTract>, ProviderError>;
}

/// GEOID → ACS attributes
pub trait DemographicsProvider: Send + Sync {
    fn demographics(&self, geoid: &str) -> Result<Option<AcsRecord>, ProviderError>;
}

// ============================================================================
// ACS variables
// ============================================================================

/// ACS 5-year variables requested per tract
pub const ACS_VARIABLES: [&str; 9] = [
    "B01001_001E", // total population
    "B01002_001E", // median age
    "B19013_001E", // median household income
    "B19301_001E", // per capita income
    "B15003_001E", // population 25+
    "B15003_022E", // bachelor's
    "B15003_023E", // master's
    "B15003_024E", // professional
    "B15003_025E", // doctorate
];

// ============================================================================
// Response parsing
// ============================================================================

/// Extract the tract from a geographies/coordinates response
pub fn parse_geocoder_response(body: &Value) -> Result<Option<GeocodedTract>, ProviderError> {
    let geographies = body
        .get("result")
        .and_then(|r| r.get("geographies"))
        .ok_or_else(|| ProviderError::Fatal("geocoder response has no result.geographies".into()))?;

    let Some(tract) = geographies
        .get("Census Tracts")
        .and_then(Value::as_array)
        .and_then(|tracts| tracts.first())
    else {
        return Ok(None);
    };

    let field = |name: &str| tract.get(name).and_then(Value::as_str).map(str::to_string);

    let geoid = match field("GEOID") {
        Some(geoid) => geoid,
        None => match (field("STATE"), field("COUNTY"), field("TRACT")) {
            (Some(s), Some(c), Some(t)) => format!("{}{}{}", s, c, t),
            _ => return Err(ProviderError::Fatal("geocoder tract entry has no GEOID".into())),
        },
    };

    Ok(Some(GeocodedTract {
        geoid,
        name: field("NAME").or_else(|| field("BASENAME")),
    }))
}

/// Parse an ACS table (header row + data rows) for one tract
///
/// Returns `None` for a table without data rows.
pub fn parse_acs_response(geoid: &str, body: &Value) -> Result<Option<AcsRecord>, ProviderError> {
    let rows = body
        .as_array()
        .ok_or_else(|| ProviderError::Fatal("ACS response is not a table".into()))?;

    let (Some(header), Some(row)) = (
        rows.first().and_then(Value::as_array),
        rows.get(1).and_then(Value::as_array),
    ) else {
        return Ok(None);
    };

    let value = |variable: &str| -> Option<f64> {
        let idx = header.iter().position(|h| h.as_str() == Some(variable))?;
        let cell = row.get(idx)?;
        let number = match cell {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }?;
        clean_acs_value(number)
    };

    let name = header
        .iter()
        .position(|h| h.as_str() == Some("NAME"))
        .and_then(|idx| row.get(idx))
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(Some(AcsRecord {
        geoid: geoid.to_string(),
        name,
        demographics: Demographics {
            total_population: value("B01001_001E"),
            median_age: value("B01002_001E"),
            median_household_income: value("B19013_001E"),
            per_capita_income: value("B19301_001E"),
            total_pop_25_plus: value("B15003_001E"),
            bachelors_degree: value("B15003_022E"),
            masters_degree: value("B15003_023E"),
            professional_degree: value("B15003_024E"),
            doctorate_degree: value("B15003_025E"),
        },
    }))
}

// ============================================================================
// HTTP plumbing
// ============================================================================

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ProviderError::Transient(err.to_string())
    } else {
        ProviderError::Fatal(err.to_string())
    }
}

/// Map a response status: `Ok(None)` when the body should be read as
/// "nothing here", `Ok(Some(response))` to read it, `Err` otherwise
fn check_status(response: Response, service: &str) -> Result<Option<Response>, ProviderError> {
    let status = response.status();
    if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(ProviderError::Transient(format!("{} returned HTTP {}", service, status)));
    }
    if !status.is_success() {
        return Err(ProviderError::Fatal(format!("{} returned HTTP {}", service, status)));
    }
    Ok(Some(response))
}

fn read_json(response: Response, service: &str) -> Result<Option<Value>, ProviderError> {
    let text = response.text().map_err(classify_transport)?;
    if text.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| ProviderError::Fatal(format!("{} returned invalid JSON: {}", service, e)))
}

fn build_client(config: &PipelineConfig) -> Result<Client> {
    Client::builder()
        .timeout(config.request_timeout())
        .build()
        .context("Failed to build HTTP client")
}

// ============================================================================
// Census geocoder
// ============================================================================

/// Census Bureau geocoder (`geographies/coordinates`)
pub struct CensusGeocoder {
    client: Client,
    url: String,
    benchmark: String,
    vintage: String,
    limiter: RateLimiter,
}

impl CensusGeocoder {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            url: config.endpoints.geocoder_url.clone(),
            benchmark: config.endpoints.geocoder_benchmark.clone(),
            vintage: config.endpoints.geocoder_vintage.clone(),
            limiter: RateLimiter::new(&config.rate_limit),
        })
    }
}

impl Geocoder for CensusGeocoder {
    fn tract_at(&self, latitude: f64, longitude: f64) -> Result<Option<GeocodedTract>, ProviderError> {
        self.limiter.wait();
        debug!(latitude, longitude, "Geocoder request");

        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("x", longitude.to_string()),
                ("y", latitude.to_string()),
                ("benchmark", self.benchmark.clone()),
                ("vintage", self.vintage.clone()),
                ("format", "json".to_string()),
            ])
            .send()
            .map_err(classify_transport)?;

        let Some(response) = check_status(response, "geocoder")? else {
            return Ok(None);
        };
        match read_json(response, "geocoder")? {
            Some(body) => parse_geocoder_response(&body),
            None => Ok(None),
        }
    }
}

// ============================================================================
// ACS client
// ============================================================================

/// ACS 5-year detailed tables API
pub struct AcsClient {
    client: Client,
    url: String,
    api_key: Option<String>,
    limiter: RateLimiter,
}

impl AcsClient {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            url: config.endpoints.acs_url.clone(),
            api_key: config.census_api_key.clone(),
            limiter: RateLimiter::new(&config.rate_limit),
        })
    }
}

impl DemographicsProvider for AcsClient {
    fn demographics(&self, geoid: &str) -> Result<Option<AcsRecord>, ProviderError> {
        if geoid.len() != 11 {
            return Err(ProviderError::Fatal(format!("malformed GEOID '{}'", geoid)));
        }
        let (state, county, tract) = (&geoid[..2], &geoid[2..5], &geoid[5..]);

        self.limiter.wait();
        debug!(geoid, "ACS request");

        let mut params = vec![
            ("get", format!("NAME,{}", ACS_VARIABLES.join(","))),
            ("for", format!("tract:{}", tract)),
            ("in", format!("state:{} county:{}", state, county)),
        ];
        if let Some(key) = &self.api_key {
            params.push(("key", key.clone()));
        }

        let response = self
            .client
            .get(&self.url)
            .query(&params)
            .send()
            .map_err(classify_transport)?;

        let Some(response) = check_status(response, "ACS")? else {
            return Ok(None);
        };
        match read_json(response, "ACS")? {
            Some(body) => parse_acs_response(geoid, &body),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_geocoder_tract() {
        let body = json!({
            "result": {
                "input": {},
                "geographies": {
                    "Census Tracts": [{
                        "GEOID": "12095016502",
                        "STATE": "12",
                        "COUNTY": "095",
                        "TRACT": "016502",
                        "BASENAME": "165.02",
                        "NAME": "Census Tract 165.02"
                    }]
                }
            }
        });
        let tract = parse_geocoder_response(&body).unwrap().unwrap();
        assert_eq!(tract.geoid, "12095016502");
        assert_eq!(tract.name.as_deref(), Some("Census Tract 165.02"));
    }

    #[test]
    fn test_parse_geocoder_builds_geoid_from_parts() {
        let body = json!({ "result": { "geographies": { "Census Tracts": [
            { "STATE": "42", "COUNTY": "101", "TRACT": "000500" }
        ]}}});
        let tract = parse_geocoder_response(&body).unwrap().unwrap();
        assert_eq!(tract.geoid, "42101000500");
    }

    #[test]
    fn test_parse_geocoder_no_tract_is_none() {
        let over_water = json!({ "result": { "geographies": {} } });
        assert_eq!(parse_geocoder_response(&over_water).unwrap(), None);

        let empty = json!({ "result": { "geographies": { "Census Tracts": [] } } });
        assert_eq!(parse_geocoder_response(&empty).unwrap(), None);
    }

    #[test]
    fn test_parse_geocoder_malformed_is_fatal() {
        let err = parse_geocoder_response(&json!({ "errors": ["bad"] })).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_parse_acs_table() {
        let body = json!([
            ["NAME", "B01001_001E", "B01002_001E", "B19013_001E", "B19301_001E",
             "B15003_001E", "B15003_022E", "B15003_023E", "B15003_024E", "B15003_025E",
             "state", "county", "tract"],
            ["Census Tract 165.02", "4123", "38.4", "-666666666", "31250",
             "2900", "610", "240", "55", "18", "12", "095", "016502"]
        ]);
        let record = parse_acs_response("12095016502", &body).unwrap().unwrap();
        let d = &record.demographics;
        assert_eq!(d.total_population, Some(4123.0));
        assert_eq!(d.median_age, Some(38.4));
        assert_eq!(d.median_household_income, None);
        assert_eq!(d.doctorate_degree, Some(18.0));
        assert!(!d.is_complete());
    }

    #[test]
    fn test_parse_acs_header_only_is_none() {
        let body = json!([["NAME", "B01001_001E"]]);
        assert_eq!(parse_acs_response("12095016502", &body).unwrap(), None);
    }
}
