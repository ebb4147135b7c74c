use std::sync::Arc;

use tracing::debug;

use crate::cache::HashCache;
use crate::error::Result;
use crate::metric::Metric;
use crate::store::Store;

/// Resolves stable hashes for label sets and records new ones.
///
/// The write worker consults the cache before anything here runs; the
/// registry repopulates it on every successful lookup or computation so
/// later requests short-circuit straight to the sample writer.
pub struct MetricRegistry {
    store: Arc<dyn Store>,
    cache: Arc<HashCache>,
}

impl MetricRegistry {
    pub fn new(store: Arc<dyn Store>, cache: Arc<HashCache>) -> Self {
        Self { store, cache }
    }

    /// Most recent persisted hash for the metric's label set. `Ok(None)`
    /// means no metadata row exists yet and the label set must be
    /// registered.
    pub async fn find_hash(&self, metric: &Metric) -> Result<Option<String>> {
        match self.store.find_hash(&metric.fingerprint).await? {
            Some(hash) => {
                self.cache.put(metric.fingerprint.clone(), hash.clone());
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    /// Fresh hash from the store's hashing primitive, for label sets
    /// without a metadata row.
    pub async fn get_hash(&self, metric: &Metric) -> Result<String> {
        let hash = self.store.compute_hash(&metric.fingerprint).await?;
        self.cache.put(metric.fingerprint.clone(), hash.clone());
        Ok(hash)
    }

    /// Persists the label metadata rows of newly registered metrics.
    pub async fn create_metadata_rows(&self, metrics: &[Metric]) -> Result<()> {
        debug!(count = metrics.len(), "creating metadata rows");
        self.store.create_metadata(metrics).await
    }

    /// Records the hash registrations of newly registered metrics.
    pub async fn create_hash_registrations(&self, metrics: &[Metric]) -> Result<()> {
        debug!(count = metrics.len(), "registering hashes");
        self.store.register_hashes(metrics).await
    }
}
