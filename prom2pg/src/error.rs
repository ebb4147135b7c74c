use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The read window ends before it starts.
    #[error("invalid time range: end {end}ms precedes start {start}ms")]
    InvalidTimeRange { start: i64, end: i64 },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A matcher carried a pattern the regex engine rejects.
    #[error("invalid regex for label {name:?}: {source}")]
    MatcherRegex {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("storage: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Storage failure reported by a non-SQL store implementation.
    #[error("storage: {0}")]
    Store(String),

    #[error("telemetry: {0}")]
    Telemetry(#[from] prometheus::Error),

    /// The write worker is gone; nothing more can be enqueued.
    #[error("write pipeline is shut down")]
    PipelineClosed,
}
