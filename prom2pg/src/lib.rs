pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod labels;
pub mod metric;
pub mod protocol;
pub mod reader;
pub mod registry;
pub mod store;
pub mod telemetry;
pub mod writer;

pub use {
    cache::HashCache,
    config::Config,
    error::{Error, Result},
    labels::Labels,
    metric::Metric,
    reader::Reader,
    registry::MetricRegistry,
    store::{PgStore, Store},
    telemetry::Telemetry,
    writer::{Pipeline, WriteHandle},
};
