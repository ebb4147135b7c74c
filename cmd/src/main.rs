use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use color_eyre::eyre::WrapErr;
use prom2pg::protocol::{ReadRequest, WriteRequest};
use prom2pg::{writer, Config, Error, HashCache, PgStore, Reader, Telemetry, WriteHandle};
use prometheus::{Encoder, Registry, TextEncoder};
use prost::Message;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(about = "Prometheus remote storage adapter for PostgreSQL/TimescaleDB")]
struct Cli {
    /// Path to a JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Override the configured listen address.
    #[arg(short, long)]
    listen: Option<String>,
}

#[derive(Clone)]
struct AppState {
    write: WriteHandle,
    reader: Arc<Reader>,
    registry: Registry,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => {
            let data = std::fs::read(path)
                .wrap_err_with(|| format!("reading config file {}", path.display()))?;
            serde_json::from_slice::<Config>(&data).wrap_err("parsing config file")?
        }
        None => Config::default(),
    };
    if let Some(listen) = cli.listen {
        config.http.listen = listen;
    }
    config.validate()?;

    let registry = Registry::new();
    let telemetry = Telemetry::register(&registry)?;
    let cache = Arc::new(HashCache::new(&config.cache));

    // one connection per stage plus one for the reader; a slow
    // transaction on one never serializes the others
    let metadata_store = Arc::new(PgStore::connect(&config.storage).await?);
    let sample_store = Arc::new(PgStore::connect(&config.storage).await?);
    let read_store = Arc::new(PgStore::connect(&config.storage).await?);

    let (write, pipeline) = writer::spawn(&config, metadata_store, sample_store, cache, telemetry);
    let reader = Arc::new(Reader::new(read_store, &config));

    let app = Router::new()
        .route(&config.http.write_path, post(handle_write))
        .route(&config.http.read_path, post(handle_read))
        .route(&config.http.metrics_path, get(handle_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.http.timeout_secs,
        )))
        .with_state(AppState {
            write,
            reader,
            registry,
        });

    let addr: SocketAddr = config
        .http
        .listen
        .parse()
        .wrap_err("parsing http.listen address")?;
    info!(%addr, "remote storage adapter listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // the server owned every WriteHandle clone; with it gone the stop
    // cascades through the pipeline channels
    info!("draining write pipeline");
    pipeline.shutdown(Duration::from_secs(10)).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "ctrl-c handler failed");
    }
    info!("shutdown signal received");
}

/// POST write path: snappy-compressed protobuf write request in, 204 out
/// once the request is queued. Persistence failures past this point
/// surface through the metrics endpoint only.
async fn handle_write(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let raw = match snap::raw::Decoder::new().decompress_vec(&body) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(%err, "write body is not valid snappy");
            return (StatusCode::BAD_REQUEST, "invalid snappy payload").into_response();
        }
    };
    let request = match WriteRequest::decode(raw.as_slice()) {
        Ok(request) => request,
        Err(err) => {
            warn!(%err, "write body is not a valid write request");
            return (StatusCode::BAD_REQUEST, "invalid protobuf payload").into_response();
        }
    };
    match state.write.enqueue(request).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            warn!(%err, "enqueue failed");
            (StatusCode::SERVICE_UNAVAILABLE, "write pipeline unavailable").into_response()
        }
    }
}

/// POST read path: snappy-compressed protobuf read request in,
/// compressed read response out. Read failures are returned to the
/// caller.
async fn handle_read(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let raw = match snap::raw::Decoder::new().decompress_vec(&body) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(%err, "read body is not valid snappy");
            return (StatusCode::BAD_REQUEST, "invalid snappy payload").into_response();
        }
    };
    let request = match ReadRequest::decode(raw.as_slice()) {
        Ok(request) => request,
        Err(err) => {
            warn!(%err, "read body is not a valid read request");
            return (StatusCode::BAD_REQUEST, "invalid protobuf payload").into_response();
        }
    };
    let response = match state.reader.read(&request).await {
        Ok(response) => response,
        Err(err) => {
            warn!(%err, "read failed");
            let status = match err {
                Error::InvalidTimeRange { .. } | Error::MatcherRegex { .. } => {
                    StatusCode::BAD_REQUEST
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            return (status, err.to_string()).into_response();
        }
    };
    let mut buf = Vec::with_capacity(response.encoded_len());
    if let Err(err) = response.encode(&mut buf) {
        warn!(%err, "encoding read response failed");
        return (StatusCode::INTERNAL_SERVER_ERROR, "encoding failed").into_response();
    }
    match snap::raw::Encoder::new().compress_vec(&buf) {
        Ok(compressed) => (
            [
                (header::CONTENT_TYPE, "application/x-protobuf"),
                (header::CONTENT_ENCODING, "snappy"),
            ],
            compressed,
        )
            .into_response(),
        Err(err) => {
            warn!(%err, "compressing read response failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "compression failed").into_response()
        }
    }
}

async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    match encoder.encode(&state.registry.gather(), &mut buf) {
        Ok(()) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], buf).into_response(),
        Err(err) => {
            warn!(%err, "encoding metrics failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding failed").into_response()
        }
    }
}
