use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::batch::Batcher;
use crate::metric::Metric;
use crate::registry::MetricRegistry;
use crate::telemetry::Telemetry;

/// Spawns the metadata stage: resolves hashes for label sets the cache
/// did not know, forwards their samples, and records metadata for the
/// ones seen for the first time. Exits once the batch channel closes
/// and every received batch has been processed.
pub(crate) fn spawn(
    registry: MetricRegistry,
    mut batches: mpsc::Receiver<Vec<Metric>>,
    mut samples: Batcher<Metric>,
    telemetry: Telemetry,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("metadata writer starting");
        while let Some(batch) = batches.recv().await {
            process(&registry, batch, &mut samples, &telemetry).await;
            // release resolved metrics promptly instead of waiting for
            // this producer's buffer to fill
            samples.flush().await;
        }
        info!("metadata writer stopped");
    })
}

async fn process(
    registry: &MetricRegistry,
    batch: Vec<Metric>,
    samples: &mut Batcher<Metric>,
    telemetry: &Telemetry,
) {
    let mut creates: Vec<Metric> = Vec::new();
    for mut metric in batch {
        match registry.find_hash(&metric).await {
            Ok(Some(hash)) => {
                metric.hash = Some(hash);
                samples.add(metric).await;
            }
            Ok(None) => match registry.get_hash(&metric).await {
                Ok(hash) => {
                    metric.hash = Some(hash);
                    // samples are queued before metadata persistence is
                    // even attempted; sample durability wins
                    samples.add(metric.clone()).await;
                    creates.push(metric);
                }
                Err(err) => {
                    warn!(
                        %err,
                        fingerprint = metric.fingerprint.as_str(),
                        "hash computation failed, dropping metric"
                    );
                    telemetry.failed_samples.inc_by(metric.samples.len() as u64);
                }
            },
            Err(err) => {
                warn!(
                    %err,
                    fingerprint = metric.fingerprint.as_str(),
                    "hash lookup failed, dropping metric"
                );
                telemetry.failed_samples.inc_by(metric.samples.len() as u64);
            }
        }
    }

    if creates.is_empty() {
        return;
    }
    if let Err(err) = registry.create_metadata_rows(&creates).await {
        warn!(%err, "metadata creation failed");
        telemetry.failed_metadata.inc();
    }
    if let Err(err) = registry.create_hash_registrations(&creates).await {
        warn!(%err, "hash registration failed");
        telemetry.failed_metadata.inc();
    }
}
