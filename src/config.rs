//! Worker configuration from environment variables.
//!
//! Environment variables:
//! - `POOL_SIZE`: idle render contexts kept per pool (default: 5)
//! - `CACHE_CAPACITY`: cached outputs (default: 50)
//! - `CACHE_TTL_SECS`: cached output lifetime (default: 1800)
//! - `BATCH_CONCURRENCY`: renders in flight per batch (default: 5)
//! - `RENDER_TIMEOUT_SECS`: single render timeout (default: 30)
//! - `JOB_RETENTION_SECS`: job and archive retention (default: 3600)
//! - `JOB_SWEEP_INTERVAL_SECS`: expiry sweep period (default: 600)
//! - `RECORDS_PATH`, `TEMPLATE_PATH`: batch inputs for the binary
//! - `FILENAME_TEMPLATE`: per-record output name, e.g. `{{client}}-quote`
//! - `OUTPUT_PATH`: where the archive is written (default: batch.zip)
//! - `OUTPUT_FORMAT`: `pdf` or `png` (default: pdf)

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::cache;
use crate::options::OutputFormat;
use crate::orchestrator;
use crate::pool;
use crate::store;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub batch_concurrency: usize,
    pub render_timeout: Duration,
    pub job_retention: Duration,
    pub sweep_interval: Duration,
    pub records_path: Option<PathBuf>,
    pub template_path: Option<PathBuf>,
    pub filename_template: Option<String>,
    pub output_path: PathBuf,
    pub output_format: OutputFormat,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: pool::DEFAULT_POOL_SIZE,
            cache_capacity: cache::DEFAULT_CAPACITY,
            cache_ttl: cache::DEFAULT_TTL,
            batch_concurrency: orchestrator::DEFAULT_CONCURRENCY,
            render_timeout: pool::DEFAULT_RENDER_TIMEOUT,
            job_retention: store::DEFAULT_RETENTION,
            sweep_interval: store::DEFAULT_SWEEP_INTERVAL,
            records_path: None,
            template_path: None,
            filename_template: None,
            output_path: PathBuf::from("batch.zip"),
            output_format: OutputFormat::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable lookup. Unset variables
    /// keep their default; unparseable ones are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            parse_or(&lookup, key, default.as_secs()).map_or(default, Duration::from_secs)
        };
        let positive_secs = |key: &str, default: Duration| {
            let value = secs(key, default);
            if value.is_zero() {
                warn!(key, default = ?default, "Ignoring zero duration setting");
                default
            } else {
                value
            }
        };

        Self {
            pool_size: parse_or(&lookup, "POOL_SIZE", defaults.pool_size)
                .unwrap_or(defaults.pool_size),
            cache_capacity: parse_or(&lookup, "CACHE_CAPACITY", defaults.cache_capacity)
                .unwrap_or(defaults.cache_capacity),
            cache_ttl: secs("CACHE_TTL_SECS", defaults.cache_ttl),
            batch_concurrency: parse_or(&lookup, "BATCH_CONCURRENCY", defaults.batch_concurrency)
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_concurrency),
            render_timeout: positive_secs("RENDER_TIMEOUT_SECS", defaults.render_timeout),
            job_retention: secs("JOB_RETENTION_SECS", defaults.job_retention),
            sweep_interval: positive_secs("JOB_SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            records_path: non_empty(&lookup, "RECORDS_PATH").map(PathBuf::from),
            template_path: non_empty(&lookup, "TEMPLATE_PATH").map(PathBuf::from),
            filename_template: non_empty(&lookup, "FILENAME_TEMPLATE"),
            output_path: non_empty(&lookup, "OUTPUT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_path),
            output_format: parse_or(&lookup, "OUTPUT_FORMAT", defaults.output_format)
                .unwrap_or(defaults.output_format),
        }
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + std::fmt::Debug,
{
    let raw = non_empty(lookup, key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, default = ?default, "Ignoring unparseable setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> WorkerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]);

        assert_eq!(cfg, WorkerConfig::default());
        assert_eq!(cfg.pool_size, 5);
        assert_eq!(cfg.cache_capacity, 50);
        assert_eq!(cfg.cache_ttl, Duration::from_secs(1800));
        assert_eq!(cfg.batch_concurrency, 5);
        assert_eq!(cfg.job_retention, Duration::from_secs(3600));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(600));
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("POOL_SIZE", "2"),
            ("CACHE_TTL_SECS", "60"),
            ("RENDER_TIMEOUT_SECS", "5"),
            ("RECORDS_PATH", "/data/records.json"),
            ("FILENAME_TEMPLATE", "{{client}}-quote"),
            ("OUTPUT_FORMAT", "png"),
        ]);

        assert_eq!(cfg.pool_size, 2);
        assert_eq!(cfg.cache_ttl, Duration::from_secs(60));
        assert_eq!(cfg.render_timeout, Duration::from_secs(5));
        assert_eq!(cfg.records_path, Some(PathBuf::from("/data/records.json")));
        assert_eq!(cfg.filename_template.as_deref(), Some("{{client}}-quote"));
        assert_eq!(cfg.output_format, OutputFormat::Png);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let cfg = config(&[
            ("POOL_SIZE", "many"),
            ("BATCH_CONCURRENCY", "0"),
            ("OUTPUT_FORMAT", "docx"),
            ("OUTPUT_PATH", "   "),
        ]);

        assert_eq!(cfg.pool_size, 5);
        assert_eq!(cfg.batch_concurrency, 5);
        assert_eq!(cfg.output_format, OutputFormat::Pdf);
        assert_eq!(cfg.output_path, PathBuf::from("batch.zip"));
    }

    #[test]
    fn test_zero_periods_fall_back() {
        let cfg = config(&[
            ("JOB_SWEEP_INTERVAL_SECS", "0"),
            ("RENDER_TIMEOUT_SECS", "0"),
            ("CACHE_TTL_SECS", "0"),
        ]);

        assert_eq!(cfg.sweep_interval, Duration::from_secs(600));
        assert_eq!(cfg.render_timeout, Duration::from_secs(30));
        // A zero TTL only disables cache hits.
        assert_eq!(cfg.cache_ttl, Duration::ZERO);
    }
}
