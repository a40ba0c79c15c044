// Site feature calculation entry point
//
// Usage:
//   site_features <STATE> <LAT> <LON> [SQ_FT]     one site, JSON on stdout
//   site_features --batch <sites.csv> <out.csv>   many sites (state, latitude, longitude[, sq_ft])
//   site_features --summary                       loaded data statistics
//
// Configuration: PIPELINE_CONFIG, DATA_DIR, CENSUS_API_KEY, RUST_LOG

use anyhow::{bail, Context, Result};
use polars::prelude::*;
use site_feature_engine::{records_to_dataframe, FeatureAssembler, PipelineConfig, SiteQuery};
use std::fs::File;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    // Initialize tracing (structured logging)
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "site_feature_engine=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let config = PipelineConfig::from_env()?;
    tracing::info!("Configuration:");
    tracing::info!("  tract extract: {:?}", config.paths.tract_extract);
    tracing::info!("  centroid table: {:?}", config.paths.centroid_table);
    tracing::info!("  facilities: {:?}", config.paths.facilities);
    tracing::info!("  radii (miles): {:?}", config.radii_miles);

    let assembler = FeatureAssembler::from_config(config)?;

    let outcome = match args.first().map(String::as_str) {
        Some("--summary") => run_summary(&assembler),
        Some("--batch") => match (args.get(1), args.get(2)) {
            (Some(input), Some(output)) => run_batch(&assembler, input, output),
            _ => bail!("usage: site_features --batch <sites.csv> <out.csv>"),
        },
        Some(_) if args.len() >= 3 => run_single(&assembler, &args),
        _ => bail!("usage: site_features <STATE> <LAT> <LON> [SQ_FT] | --batch <in> <out> | --summary"),
    };

    assembler.flush_cache()?;
    outcome
}

fn run_single(assembler: &FeatureAssembler, args: &[String]) -> Result<()> {
    let latitude: f64 = args[1].parse().with_context(|| format!("Invalid latitude: {}", args[1]))?;
    let longitude: f64 = args[2].parse().with_context(|| format!("Invalid longitude: {}", args[2]))?;
    let sq_ft: Option<f64> = args
        .get(3)
        .map(|s| s.parse().with_context(|| format!("Invalid square footage: {}", s)))
        .transpose()?;

    let base = assembler.calculate_base_features(&args[0], latitude, longitude, sq_ft)?;
    let model = assembler.validate_and_expand(&base, base.state)?;

    let features: serde_json::Map<String, serde_json::Value> = model
        .iter()
        .map(|(name, value)| (name.to_string(), serde_json::json!(value)))
        .collect();

    let output = serde_json::json!({
        "base": base,
        "model_features": features,
        "imputed": model.imputed,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_batch(assembler: &FeatureAssembler, input: &str, output: &str) -> Result<()> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(input.into()))
        .with_context(|| format!("Failed to create CSV reader: {}", input))?
        .finish()
        .with_context(|| format!("Failed to load sites CSV: {}", input))?;

    let states = df.column("state")?.cast(&DataType::String)?;
    let lats = df.column("latitude")?.cast(&DataType::Float64)?;
    let lons = df.column("longitude")?.cast(&DataType::Float64)?;
    let sizes = match df.column("sq_ft") {
        Ok(c) => Some(c.cast(&DataType::Float64)?),
        Err(_) => None,
    };

    let (states, lats, lons) = (states.str()?, lats.f64()?, lons.f64()?);
    let sizes = sizes.as_ref().map(|c| c.f64()).transpose()?;

    let queries: Vec<SiteQuery> = (0..df.height())
        .map(|i| SiteQuery {
            state: states.get(i).unwrap_or_default().to_string(),
            latitude: lats.get(i).unwrap_or(f64::NAN),
            longitude: lons.get(i).unwrap_or(f64::NAN),
            sq_ft: sizes.and_then(|s| s.get(i)),
        })
        .collect();

    let results = assembler.calculate_model_batch(&queries);

    let mut records = Vec::new();
    for (query, result) in queries.iter().zip(results) {
        match result {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!(
                state = %query.state,
                latitude = query.latitude,
                longitude = query.longitude,
                error = %e,
                "Site skipped"
            ),
        }
    }

    tracing::info!("{} of {} sites succeeded", records.len(), queries.len());

    let mut out = records_to_dataframe(&records)?;
    let mut file = File::create(output).with_context(|| format!("Failed to create {}", output))?;
    CsvWriter::new(&mut file)
        .finish(&mut out)
        .with_context(|| format!("Failed to write {}", output))?;
    Ok(())
}

fn run_summary(assembler: &FeatureAssembler) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&assembler.summary())?);
    Ok(())
}
