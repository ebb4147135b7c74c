use serde::Deserialize;

use crate::error::{Error, Result};

/// Runtime configuration for the adapter.
///
/// The server binary deserializes this from a JSON file; every field has
/// a default suiting a small local deployment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub read: ReadConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// `tokio-postgres` connection string.
    pub dsn: String,
    /// Schema holding the samples, labels and hashes tables.
    pub schema: String,
    pub table_samples: String,
    pub table_labels: String,
    pub table_hashes: String,
    /// Units per insert batch; applies to both writer stages and sizes
    /// the stage channels.
    pub batch_size: usize,
    /// Seconds between forced flushes of partial batches.
    pub flush_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dsn: "host=127.0.0.1 port=5432 user=prom2pg dbname=metrics".to_owned(),
            schema: "metrics".to_owned(),
            table_samples: "samples".to_owned(),
            table_labels: "labels".to_owned(),
            table_hashes: "hashes".to_owned(),
            batch_size: 100,
            flush_interval_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Shard count; rounded up to a power of two.
    pub shards: usize,
    /// Seconds an entry stays valid.
    pub ttl_secs: u64,
    /// Expected entry count.
    pub items: usize,
    /// Expected bytes per entry.
    pub item_size: usize,
    /// Hard memory budget in megabytes; together with `item_size` it
    /// caps the entry count.
    pub max_size_mb: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shards: 256,
            ttl_secs: 48 * 3600,
            items: 10_000,
            item_size: 128,
            max_size_mb: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadConfig {
    /// Most aggregation buckets a single query may return.
    pub max_samples: i64,
    /// Narrowest aggregation bucket in seconds.
    pub min_period_secs: i64,
    /// Quantile collapsing each bucket to one value, in (0, 1].
    pub quantile: f64,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            max_samples: 8192,
            min_period_secs: 10,
            quantile: 0.75,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub listen: String,
    pub write_path: String,
    pub read_path: String,
    pub metrics_path: String,
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9201".to_owned(),
            write_path: "/write".to_owned(),
            read_path: "/read".to_owned(),
            metrics_path: "/metrics".to_owned(),
            timeout_secs: 30,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.storage.batch_size == 0 {
            return Err(Error::Config("storage.batch_size must be positive".into()));
        }
        if self.read.max_samples < 1 {
            return Err(Error::Config(format!(
                "read.max_samples must be positive, got {}",
                self.read.max_samples
            )));
        }
        if self.read.min_period_secs < 1 {
            return Err(Error::Config(format!(
                "read.min_period_secs must be positive, got {}",
                self.read.min_period_secs
            )));
        }
        if !(self.read.quantile > 0.0 && self.read.quantile <= 1.0) {
            return Err(Error::Config(format!(
                "read.quantile must be in (0, 1], got {}",
                self.read.quantile
            )));
        }
        if self.cache.shards == 0 {
            return Err(Error::Config("cache.shards must be positive".into()));
        }
        Ok(())
    }
}
