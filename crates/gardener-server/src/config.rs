//! Startup configuration, read once from the environment and passed by
//! reference to every constructor -- no component looks up its own
//! environment variables.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};

use gardener_core::job::SourceConfig;

/// Everything the binary needs to wire up a controller instance. Built once
/// in `main` via [`Config::from_env`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Target cloud project (`PROJECT`), passed through to the BigQuery
    /// backend.
    pub project: String,
    /// This replica's identity for the ownership lease: `HOSTNAME` and
    /// `GAE_INSTANCE`, falling back to `INSTANCE_ID` when not running on
    /// GAE.
    pub hostname: String,
    pub instance_id: String,
    /// Postgres DSN backing `gardener-persistence`.
    pub database_url: String,
    pub port: u16,

    pub save_interval: Duration,
    pub expiration_time: chrono::Duration,
    pub cleanup_delay: chrono::Duration,
    pub start_date: DateTime<Utc>,
    /// The stabilization cutoff used by `advance_date`, configurable
    /// rather than hard-coded.
    pub stabilization_delay: chrono::Duration,

    pub lease_interval: Duration,
    pub watch_period: Duration,
    pub monitor_concurrency: usize,

    /// The fixed catalog of job specs, materialized once at startup from
    /// `SOURCES_JSON`.
    pub sources: Vec<SourceConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let project = env_required("PROJECT")?;
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let instance_id = std::env::var("GAE_INSTANCE")
            .or_else(|_| std::env::var("INSTANCE_ID"))
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
        let database_url = env_required("DATABASE_URL")?;
        let port = env_parsed("PORT", 8080)?;

        let save_interval = Duration::from_secs(env_parsed("SAVE_INTERVAL_SECS", 60)?);
        let expiration_time = chrono::Duration::seconds(env_parsed("EXPIRATION_SECS", 0)?);
        let cleanup_delay =
            chrono::Duration::seconds(env_parsed("CLEANUP_DELAY_SECS", 24 * 3600)?);
        let start_date = parse_start_date(&env_required("START_DATE")?)?;
        let stabilization_delay =
            chrono::Duration::hours(env_parsed("STABILIZATION_DELAY_HOURS", 36)?);

        let lease_interval = Duration::from_secs(env_parsed("LEASE_INTERVAL_SECS", 60)?);
        let watch_period = Duration::from_secs(env_parsed("WATCH_PERIOD_SECS", 30)?);
        let monitor_concurrency = env_parsed("MONITOR_CONCURRENCY", 16)?;

        let sources = load_sources()?;

        Ok(Config {
            project,
            hostname,
            instance_id,
            database_url,
            port,
            save_interval,
            expiration_time,
            cleanup_delay,
            start_date,
            stabilization_delay,
            lease_interval,
            watch_period,
            monitor_concurrency,
            sources,
        })
    }
}

fn env_required(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{name} must be set"))
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {name}: {e}")),
        Err(_) => Ok(default),
    }
}

fn parse_start_date(s: &str) -> Result<DateTime<Utc>> {
    let naive = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("START_DATE {s:?} is not YYYY-MM-DD"))?;
    Ok(Utc.from_utc_datetime(&naive.and_hms_opt(0, 0, 0).unwrap()))
}

/// `SOURCES_JSON` is either a path to a JSON file or, if it doesn't exist as
/// a file, the inline JSON array itself -- convenient for small deployments
/// and container environments that pass config via an env var rather than a
/// mounted file.
fn load_sources() -> Result<Vec<SourceConfig>> {
    let raw = env_required("SOURCES_JSON")?;
    let text = match std::fs::read_to_string(&raw) {
        Ok(contents) => contents,
        Err(_) => raw,
    };
    let sources: Vec<SourceConfig> =
        serde_json::from_str(&text).context("failed to parse SOURCES_JSON")?;
    if sources.is_empty() {
        anyhow::bail!("SOURCES_JSON produced an empty catalog");
    }
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_date_parses_plain_dates() {
        let d = parse_start_date("2020-01-01").unwrap();
        assert_eq!(d.format("%Y-%m-%d").to_string(), "2020-01-01");
    }

    #[test]
    fn start_date_rejects_garbage() {
        assert!(parse_start_date("not-a-date").is_err());
    }
}
