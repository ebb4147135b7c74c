//! Batching write pipeline: a routing worker feeding the metadata and
//! sample stages.
//!
//! The worker task owns the stage batchers, so the single-producer
//! contract on [`Batcher`] holds by construction; the metadata stage
//! owns a second batcher into the sample channel. Stop is cooperative:
//! closing the request channel cascades stage by stage, each one
//! flushing and draining before it exits.

mod metadata;
mod samples;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::batch::Batcher;
use crate::cache::HashCache;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metric::Metric;
use crate::protocol::WriteRequest;
use crate::registry::MetricRegistry;
use crate::store::Store;
use crate::telemetry::Telemetry;

/// Enqueues decoded write requests into the pipeline.
///
/// Cheap to clone. Enqueueing blocks only while the worker channel is
/// full, never on storage I/O; persistence failures past this point are
/// visible through the telemetry counters only.
#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl WriteHandle {
    pub async fn enqueue(&self, request: WriteRequest) -> Result<()> {
        self.tx.send(request).await.map_err(|_| Error::PipelineClosed)
    }
}

/// Running pipeline tasks. Drop every [`WriteHandle`] first, then await
/// [`Pipeline::shutdown`].
pub struct Pipeline {
    worker: JoinHandle<()>,
    metadata: JoinHandle<()>,
    samples: JoinHandle<()>,
}

impl Pipeline {
    /// Waits for the stages to drain, up to `timeout`. On timeout the
    /// stages are left detached and in-flight samples may be lost; a
    /// transaction already in progress completes or fails on its own.
    pub async fn shutdown(self, timeout: Duration) {
        let drained = async {
            let _ = self.worker.await;
            let _ = self.metadata.await;
            let _ = self.samples.await;
        };
        match tokio::time::timeout(timeout, drained).await {
            Ok(()) => info!("write pipeline drained"),
            Err(_) => warn!(?timeout, "write pipeline shutdown timed out, samples may be lost"),
        }
    }
}

/// Spawns the write worker and both writer stages.
///
/// The metadata stage resolves hashes through `metadata_store`; the
/// sample stage inserts through `sample_store`. They are separate
/// handles so a slow transaction on one never serializes the other.
pub fn spawn(
    config: &Config,
    metadata_store: Arc<dyn Store>,
    sample_store: Arc<dyn Store>,
    cache: Arc<HashCache>,
    telemetry: Telemetry,
) -> (WriteHandle, Pipeline) {
    let batch_size = config.storage.batch_size.max(1);
    let (request_tx, request_rx) = mpsc::channel(batch_size);
    let (metadata_tx, metadata_rx) = mpsc::channel(batch_size);
    let (sample_tx, sample_rx) = mpsc::channel(batch_size);

    let registry = MetricRegistry::new(metadata_store, cache.clone());
    let metadata = metadata::spawn(
        registry,
        metadata_rx,
        Batcher::new(batch_size, sample_tx.clone()),
        telemetry.clone(),
    );
    let samples = samples::spawn(sample_store, sample_rx, telemetry.clone());

    let worker = tokio::spawn(run_worker(
        request_rx,
        Batcher::new(batch_size, metadata_tx),
        Batcher::new(batch_size, sample_tx),
        cache,
        telemetry,
        Duration::from_secs(config.storage.flush_interval_secs.max(1)),
    ));

    (
        WriteHandle { tx: request_tx },
        Pipeline {
            worker,
            metadata,
            samples,
        },
    )
}

async fn run_worker(
    mut requests: mpsc::Receiver<WriteRequest>,
    mut metadata_batch: Batcher<Metric>,
    mut sample_batch: Batcher<Metric>,
    cache: Arc<HashCache>,
    telemetry: Telemetry,
    flush_interval: Duration,
) {
    info!("write worker starting");
    let mut flush_tick = tokio::time::interval(flush_interval);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(request) => {
                    route(request, &mut metadata_batch, &mut sample_batch, &cache, &telemetry)
                        .await;
                }
                None => break,
            },
            _ = flush_tick.tick() => {
                metadata_batch.flush().await;
                sample_batch.flush().await;
            }
        }
    }
    metadata_batch.flush().await;
    sample_batch.flush().await;
    info!("write worker stopped");
}

/// Fans one request out into per-series metrics. Cache hits go straight
/// to the sample stage; everything else goes through the metadata stage,
/// which resolves the hash and forwards the samples itself.
async fn route(
    request: WriteRequest,
    metadata_batch: &mut Batcher<Metric>,
    sample_batch: &mut Batcher<Metric>,
    cache: &HashCache,
    telemetry: &Telemetry,
) {
    for series in &request.timeseries {
        telemetry.received_samples.inc_by(series.samples.len() as u64);
        let mut metric = Metric::from_series(series);
        match cache.get(&metric.fingerprint) {
            Some(hash) => {
                telemetry.cache_hits.inc();
                metric.hash = Some(hash);
                sample_batch.add(metric).await;
            }
            None => {
                telemetry.cache_misses.inc();
                metadata_batch.add(metric).await;
            }
        }
    }
}
