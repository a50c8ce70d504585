use std::{fs::File, path::PathBuf};

use anyhow::{anyhow, Context, Result};
use bucketdb::{parse_csv, Backend, Bucket, Config, Database, FieldSpec, Service};
use chrono::{SecondsFormat, TimeZone, Utc};
use serde_json::json;
use tempfile::tempdir;
use tracing::{info, info_span, warn};
use tracing_subscriber::{fmt, EnvFilter};

const BUCKET: &str = "licensing";

fn setup_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("bucketdb_example=info".parse().unwrap());

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config() -> Result<Config> {
    match std::env::args().nth(1) {
        Some(path) => Config::from_file_with_env(&path)
            .with_context(|| format!("loading configuration from {path}")),
        None => Ok(Config::from_env()?),
    }
}

fn sample_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("data/sample.csv")
}

fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn main() -> Result<()> {
    let mut config = load_config()?;
    setup_logging(&config);

    let temp_dir = tempdir().context("creating temp directory")?;
    if config.storage.backend == Backend::Banyan && config.storage.state_path.is_none() {
        let state_path = temp_dir.path().join("bucket_roots.json");
        info!("Writing bucket roots to {:?}", state_path);
        config.storage.state_path = Some(state_path);
    }
    config.raw_queries_allowed.insert(BUCKET.to_string(), true);

    let storage = config.open_storage()?;
    let database = Database::new(storage, config.database_name.clone());
    if !database.alive() {
        warn!("storage reports it is not alive");
    }

    let ingest_span = info_span!("csv_ingest", bucket = BUCKET).entered();
    let schema = FieldSpec::schema_from_json(&json!([{}, {}, {}, {"type": "int", "min": 0}]))?;
    let file = File::open(sample_path()).context("opening sample csv")?;
    let records = parse_csv(file, Some(&schema))?;
    info!("Parsed {} records from CSV.", records.len());
    let stored = Bucket::new(&database, BUCKET)?.store(records)?;
    info!("Stored {} records.", stored);
    drop(ingest_span);

    let service = Service::new(config, database);
    println!("{}", serde_json::to_string_pretty(&service.status().body)?);

    let anchor = Utc
        .with_ymd_and_hms(2012, 12, 24, 0, 0, 0)
        .single()
        .ok_or_else(|| anyhow!("invalid anchor date"))?
        .to_rfc3339_opts(SecondsFormat::Secs, true);

    let queries = vec![
        (
            "latest three applications",
            params(&[("sort_by", "_timestamp:descending"), ("limit", "3")]),
        ),
        (
            "applications per authority with fees",
            params(&[
                ("group_by", "authority"),
                ("collect", "fees"),
                ("sort_by", "_count:descending"),
            ]),
        ),
        (
            "street trading applications per authority",
            params(&[("group_by", "authority"), ("filter_by", "licence_name:street trading")]),
        ),
        (
            "weekly applications per authority",
            params(&[("group_by", "authority"), ("period", "week")]),
        ),
        (
            "last two weeks",
            params(&[("period", "week"), ("duration", "2"), ("date", anchor.as_str())]),
        ),
        (
            "an invalid request",
            params(&[("group_by", "_timestamp")]),
        ),
    ];

    for (title, params) in queries {
        let _span = info_span!("query", title).entered();
        let response = service.read(BUCKET, &params);
        info!(status = response.status, "query finished");
        println!("# {title} ({})", response.status);
        println!("{}", serde_json::to_string_pretty(&response.body)?);
    }

    info!("Example finished.");
    Ok(())
}
