use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use url::Url;

use crate::retry::RetryPolicy;
use crate::util::env::{db_url, env_opt, env_parse, env_parse_opt};

pub const DEFAULT_REGISTRY_URL: &str = "https://brasilapi.com.br/api/cnpj/v1";

#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub base_url: String,
    pub timeout: Duration,
}

/// Reads `{PREFIX}_BASE_URL` / `{PREFIX}_TIMEOUT_SECS`. A base URL of `off`
/// or `none` disables the source.
fn source_from_env(prefix: &str, default_url: Option<&str>, default_timeout: u64) -> Option<SourceConfig> {
    let url = env_opt(&format!("{prefix}_BASE_URL")).or_else(|| default_url.map(str::to_string))?;
    if matches!(url.trim().to_ascii_lowercase().as_str(), "off" | "none") {
        return None;
    }
    Some(SourceConfig {
        base_url: url,
        timeout: Duration::from_secs(env_parse(&format!("{prefix}_TIMEOUT_SECS"), default_timeout)),
    })
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Tokens per second.
    pub rate_per_sec: f64,
    pub burst: u32,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub checkpoint_path: PathBuf,
    /// Save after this many newly processed keys.
    pub checkpoint_every: usize,
    pub checkpoint_interval: Duration,
    pub progress_target: Option<u64>,
    pub retry: RetryPolicy,
    pub primary: Option<SourceConfig>,
    pub primary_api_key: Option<String>,
    pub secondary: Option<SourceConfig>,
    pub registry: Option<SourceConfig>,
    pub synthetic_probes: usize,
    pub synthetic_seed: Option<u64>,
    pub prefix_table_path: Option<PathBuf>,
    pub locations_csv: PathBuf,
    pub categories_csv: PathBuf,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 64,
            rate_per_sec: 3.0,
            burst: 3,
            batch_size: 50,
            batch_timeout: Duration::from_millis(5000),
            checkpoint_path: PathBuf::from("harvest_checkpoint.json"),
            checkpoint_every: 100,
            checkpoint_interval: Duration::from_secs(30),
            progress_target: None,
            retry: RetryPolicy::default(),
            primary: None,
            primary_api_key: None,
            secondary: None,
            registry: Some(SourceConfig {
                base_url: DEFAULT_REGISTRY_URL.to_string(),
                timeout: Duration::from_secs(20),
            }),
            synthetic_probes: 3,
            synthetic_seed: None,
            prefix_table_path: None,
            locations_csv: PathBuf::from("data/locations.csv"),
            categories_csv: PathBuf::from("data/categories.csv"),
            database_url: None,
            db_max_connections: 5,
        }
    }
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_parse("HARVEST_WORKERS", d.workers),
            queue_capacity: env_parse("HARVEST_QUEUE_CAPACITY", d.queue_capacity),
            rate_per_sec: env_parse("HARVEST_RPS", d.rate_per_sec),
            burst: env_parse("HARVEST_BURST", d.burst),
            batch_size: env_parse("HARVEST_BATCH_SIZE", d.batch_size),
            batch_timeout: Duration::from_millis(env_parse("HARVEST_BATCH_TIMEOUT_MS", 5000u64)),
            checkpoint_path: env_opt("HARVEST_CHECKPOINT_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.checkpoint_path),
            checkpoint_every: env_parse("HARVEST_CHECKPOINT_EVERY", d.checkpoint_every),
            checkpoint_interval: Duration::from_secs(env_parse("HARVEST_CHECKPOINT_SECS", 30u64)),
            progress_target: env_parse_opt("HARVEST_TARGET"),
            retry: RetryPolicy::new(
                env_parse("HARVEST_RETRY_ATTEMPTS", d.retry.max_attempts),
                Duration::from_millis(env_parse("HARVEST_RETRY_BASE_MS", 1000u64)),
            ),
            primary: source_from_env("PRIMARY", None, 10),
            primary_api_key: env_opt("PRIMARY_API_KEY"),
            secondary: source_from_env("SECONDARY", None, 20),
            registry: source_from_env("REGISTRY", Some(DEFAULT_REGISTRY_URL), 20),
            synthetic_probes: env_parse("SYNTHETIC_PROBES", d.synthetic_probes),
            synthetic_seed: env_parse_opt("SYNTHETIC_SEED"),
            prefix_table_path: env_opt("PREFIX_TABLE_PATH").map(PathBuf::from),
            locations_csv: env_opt("LOCATIONS_CSV")
                .map(PathBuf::from)
                .unwrap_or(d.locations_csv),
            categories_csv: env_opt("CATEGORIES_CSV")
                .map(PathBuf::from)
                .unwrap_or(d.categories_csv),
            database_url: db_url(),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", d.db_max_connections),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.batch_size == 0 {
            bail!("batch size must be at least 1");
        }
        if self.queue_capacity == 0 {
            bail!("queue capacity must be at least 1");
        }
        if !(self.rate_per_sec.is_finite() && self.rate_per_sec > 0.0) {
            bail!("rate must be a positive number of requests per second");
        }
        let sources = [
            ("primary", &self.primary),
            ("secondary", &self.secondary),
            ("registry", &self.registry),
        ];
        for (name, source) in sources {
            if let Some(s) = source {
                let url = Url::parse(&s.base_url)
                    .with_context(|| format!("{name} base URL {:?}", s.base_url))?;
                if !matches!(url.scheme(), "http" | "https") {
                    bail!("{name} base URL must be http(s), got {}", url.scheme());
                }
            }
        }
        if sources.iter().all(|(_, s)| s.is_none()) {
            bail!("no resolution source configured");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        HarvestConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_values() {
        let mut c = HarvestConfig {
            workers: 0,
            ..HarvestConfig::default()
        };
        assert!(c.validate().is_err());
        c.workers = 2;
        c.rate_per_sec = 0.0;
        assert!(c.validate().is_err());
        c.rate_per_sec = 1.0;
        c.primary = Some(SourceConfig {
            base_url: "ftp://example.com".into(),
            timeout: Duration::from_secs(1),
        });
        assert!(c.validate().is_err());
        c.primary = None;
        c.registry = None;
        assert!(c.validate().is_err());
    }
}
