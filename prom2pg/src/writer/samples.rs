use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metric::Metric;
use crate::store::Store;
use crate::telemetry::Telemetry;

/// Spawns the sample stage: one insert transaction per received batch.
/// Exits once the batch channel closes and every received batch has
/// been written.
pub(crate) fn spawn(
    store: Arc<dyn Store>,
    mut batches: mpsc::Receiver<Vec<Metric>>,
    telemetry: Telemetry,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("sample writer starting");
        while let Some(batch) = batches.recv().await {
            write_batch(store.as_ref(), batch, &telemetry).await;
        }
        info!("sample writer stopped");
    })
}

async fn write_batch(store: &dyn Store, batch: Vec<Metric>, telemetry: &Telemetry) {
    let samples: u64 = batch.iter().map(|metric| metric.samples.len() as u64).sum();
    debug!(metrics = batch.len(), samples, "writing sample batch");
    let timer = telemetry.write_duration.start_timer();
    match store.insert_samples(&batch).await {
        Ok(outcome) => {
            telemetry.sent_samples.inc_by(outcome.written);
            if outcome.failed > 0 {
                telemetry.failed_samples.inc_by(outcome.failed);
            }
        }
        // no in-process retry; the batch is dropped and counted
        Err(err) => {
            warn!(%err, "sample batch failed");
            telemetry.failed_samples.inc_by(samples);
        }
    }
    timer.observe_duration();
}
