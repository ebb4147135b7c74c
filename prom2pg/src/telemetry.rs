use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};

use crate::error::Result;

/// Counters and timings shared by the pipeline stages.
///
/// Constructed once at startup against the process registry and handed
/// down to each stage. Write-side failures never reach the original
/// caller; these counters are the only place they surface.
#[derive(Clone)]
pub struct Telemetry {
    /// Samples decoded from inbound write requests.
    pub received_samples: IntCounter,
    /// Samples committed to the store.
    pub sent_samples: IntCounter,
    /// Samples dropped anywhere along the write path.
    pub failed_samples: IntCounter,
    /// Failed metadata or registration transactions.
    pub failed_metadata: IntCounter,
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    /// Duration of sample batch inserts.
    pub write_duration: Histogram,
}

impl Telemetry {
    pub fn register(registry: &Registry) -> Result<Self> {
        let received_samples = IntCounter::with_opts(Opts::new(
            "received_samples_total",
            "Total number of samples received in write requests.",
        ))?;
        let sent_samples = IntCounter::with_opts(Opts::new(
            "sent_samples_total",
            "Total number of samples written to remote storage.",
        ))?;
        let failed_samples = IntCounter::with_opts(Opts::new(
            "failed_samples_total",
            "Total number of samples dropped on the way to remote storage.",
        ))?;
        let failed_metadata = IntCounter::with_opts(Opts::new(
            "failed_metadata_total",
            "Total number of failed metadata or hash registration writes.",
        ))?;
        let cache_hits = IntCounter::with_opts(Opts::new(
            "hash_cache_hits_total",
            "Label sets resolved from the hash cache.",
        ))?;
        let cache_misses = IntCounter::with_opts(Opts::new(
            "hash_cache_misses_total",
            "Label sets that required a registry lookup.",
        ))?;
        let write_duration = Histogram::with_opts(HistogramOpts::new(
            "sent_batch_duration_seconds",
            "Duration of sample batch insert transactions.",
        ))?;

        registry.register(Box::new(received_samples.clone()))?;
        registry.register(Box::new(sent_samples.clone()))?;
        registry.register(Box::new(failed_samples.clone()))?;
        registry.register(Box::new(failed_metadata.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(write_duration.clone()))?;

        Ok(Self {
            received_samples,
            sent_samples,
            failed_samples,
            failed_metadata,
            cache_hits,
            cache_misses,
            write_duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_exposes_counters() {
        let registry = Registry::new();
        let telemetry = Telemetry::register(&registry).unwrap();
        telemetry.received_samples.inc_by(3);
        let families = registry.gather();
        assert!(families
            .iter()
            .any(|family| family.get_name() == "received_samples_total"));
    }
}
