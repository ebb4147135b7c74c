//! Interface boundary to the columnar time-series store.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Statement, Transaction};
use tracing::warn;

use crate::config::StorageConfig;
use crate::error::Result;
use crate::labels::{Fingerprint, METRIC_NAME_LABEL};
use crate::metric::Metric;
use crate::protocol::LabelMatcher;
use crate::reader::TimeWindow;

/// Aggregate row of a series select: bucket sample count, bucket
/// timestamp in milliseconds, metric name, rendered `name=value` tags
/// and the aggregated value.
#[derive(Debug, Clone)]
pub struct SeriesRow {
    pub count: i64,
    pub timestamp_ms: i64,
    pub name: String,
    pub tags: Vec<String>,
    pub value: f64,
}

/// Outcome of a bulk sample insert.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertOutcome {
    pub written: u64,
    pub failed: u64,
}

/// Value bound into generated SQL. User-supplied text always travels
/// through these, never through string interpolation.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Int(i64),
    Float(f64),
    Text(String),
    TextArray(Vec<String>),
}

impl SqlParam {
    fn as_pg(&self) -> &(dyn ToSql + Sync) {
        match self {
            SqlParam::Int(value) => value,
            SqlParam::Float(value) => value,
            SqlParam::Text(value) => value,
            SqlParam::TextArray(value) => value,
        }
    }
}

/// A compiled range query: the SQL text to execute plus the structured
/// plan it was compiled from, so a store that does not speak SQL can
/// evaluate the same query.
#[derive(Debug, Clone)]
pub struct SeriesQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
    pub window: TimeWindow,
    pub quantile: f64,
    pub matchers: Vec<LabelMatcher>,
}

/// Operations the adapter needs from the store.
///
/// Each writer stage holds its own instance (no cross-stage transaction
/// sharing) and the reader holds another; the cache-hit write path never
/// touches the store at all.
#[async_trait]
pub trait Store: Send + Sync {
    /// Most recent persisted hash for a fingerprint. `Ok(None)` is the
    /// normal not-yet-registered branch, not a failure.
    async fn find_hash(&self, fingerprint: &Fingerprint) -> Result<Option<String>>;

    /// Applies the store's own hashing primitive to the fingerprint.
    /// Deterministic: every caller hashing the same fingerprint gets a
    /// byte-identical result.
    async fn compute_hash(&self, fingerprint: &Fingerprint) -> Result<String>;

    /// Inserts one metadata row per label of each metric in a single
    /// transaction. Row failures are logged and skipped; the transaction
    /// commits once every row has been attempted.
    async fn create_metadata(&self, metrics: &[Metric]) -> Result<()>;

    /// Records one registration row per metric hash, same best-effort
    /// per-row policy as [`Store::create_metadata`].
    async fn register_hashes(&self, metrics: &[Metric]) -> Result<()>;

    /// Bulk-inserts every (hash, value, timestamp) row of the batch in
    /// one transaction, committing whatever rows succeeded.
    async fn insert_samples(&self, metrics: &[Metric]) -> Result<InsertOutcome>;

    /// Runs one aggregate series select.
    async fn select_series(&self, query: &SeriesQuery) -> Result<Vec<SeriesRow>>;
}

struct StoreSql {
    find_hash: String,
    compute_hash: String,
    insert_label: String,
    insert_hash: String,
    insert_sample: String,
}

impl StoreSql {
    fn new(config: &StorageConfig) -> Self {
        let labels = format!("{}.{}", config.schema, config.table_labels);
        let hashes = format!("{}.{}", config.schema, config.table_hashes);
        let samples = format!("{}.{}", config.schema, config.table_samples);
        Self {
            find_hash: format!(
                "SELECT hash FROM {labels} WHERE metric = $1 ORDER BY date DESC LIMIT 1"
            ),
            compute_hash: "SELECT md5($1)".to_owned(),
            insert_label: format!(
                "INSERT INTO {labels} (date, hash, metric, name, val) \
                 VALUES (CURRENT_DATE, $1, $2, $3, $4)"
            ),
            insert_hash: format!("INSERT INTO {hashes} (hash, tags) VALUES ($1, $2)"),
            insert_sample: format!(
                "INSERT INTO {samples} (date, name, tags, hash, val, ts) \
                 VALUES (to_timestamp($5)::date, $1, $2, $3, $4, to_timestamp($5))"
            ),
        }
    }
}

/// Store implementation over one PostgreSQL connection.
pub struct PgStore {
    client: Mutex<Client>,
    sql: StoreSql,
}

impl PgStore {
    /// Opens one connection and drives it on a background task.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(&config.dsn, NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(%err, "postgres connection terminated");
            }
        });
        Ok(Self {
            client: Mutex::new(client),
            sql: StoreSql::new(config),
        })
    }
}

// Postgres aborts the surrounding transaction after any failed
// statement, so each row runs under a savepoint and a failed row rolls
// back alone while the rest of the batch proceeds.
async fn exec_row(
    tx: &Transaction<'_>,
    stmt: &Statement,
    params: &[&(dyn ToSql + Sync)],
) -> bool {
    if let Err(err) = tx.batch_execute("SAVEPOINT batch_row").await {
        warn!(%err, "savepoint failed, dropping row");
        return false;
    }
    match tx.execute(stmt, params).await {
        Ok(_) => {
            if let Err(err) = tx.batch_execute("RELEASE SAVEPOINT batch_row").await {
                warn!(%err, "savepoint release failed");
            }
            true
        }
        Err(err) => {
            warn!(%err, "row insert failed, skipping");
            if let Err(err) = tx.batch_execute("ROLLBACK TO SAVEPOINT batch_row").await {
                warn!(%err, "savepoint rollback failed");
            }
            false
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn find_hash(&self, fingerprint: &Fingerprint) -> Result<Option<String>> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(self.sql.find_hash.as_str(), &[&fingerprint.as_str()])
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get(0)?)),
            None => Ok(None),
        }
    }

    async fn compute_hash(&self, fingerprint: &Fingerprint) -> Result<String> {
        let client = self.client.lock().await;
        let row = client
            .query_one(self.sql.compute_hash.as_str(), &[&fingerprint.as_str()])
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn create_metadata(&self, metrics: &[Metric]) -> Result<()> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        let stmt = tx.prepare(self.sql.insert_label.as_str()).await?;
        for metric in metrics {
            let Some(hash) = metric.hash.as_deref() else {
                continue;
            };
            for label in metric.labels.iter() {
                exec_row(
                    &tx,
                    &stmt,
                    &[
                        &hash,
                        &metric.fingerprint.as_str(),
                        &label.name,
                        &label.value,
                    ],
                )
                .await;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn register_hashes(&self, metrics: &[Metric]) -> Result<()> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        let stmt = tx.prepare(self.sql.insert_hash.as_str()).await?;
        for metric in metrics {
            let Some(hash) = metric.hash.as_deref() else {
                continue;
            };
            exec_row(&tx, &stmt, &[&hash, &metric.fingerprint.as_str()]).await;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_samples(&self, metrics: &[Metric]) -> Result<InsertOutcome> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        let stmt = tx.prepare(self.sql.insert_sample.as_str()).await?;
        let mut outcome = InsertOutcome::default();
        for metric in metrics {
            let Some(hash) = metric.hash.as_deref() else {
                warn!(
                    fingerprint = metric.fingerprint.as_str(),
                    "unresolved metric reached the sample writer, skipping"
                );
                outcome.failed += metric.samples.len() as u64;
                continue;
            };
            let name = metric.labels.get(METRIC_NAME_LABEL).unwrap_or_default();
            let tags = metric.labels.rendered();
            for sample in &metric.samples {
                let epoch_secs = sample.timestamp as f64 / 1000.0;
                let written = exec_row(
                    &tx,
                    &stmt,
                    &[&name, &tags, &hash, &sample.value, &epoch_secs],
                )
                .await;
                if written {
                    outcome.written += 1;
                } else {
                    outcome.failed += 1;
                }
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn select_series(&self, query: &SeriesQuery) -> Result<Vec<SeriesRow>> {
        let client = self.client.lock().await;
        let params: Vec<&(dyn ToSql + Sync)> = query.params.iter().map(SqlParam::as_pg).collect();
        let rows = client.query(query.sql.as_str(), &params).await?;
        rows.iter()
            .map(|row| {
                Ok(SeriesRow {
                    count: row.try_get(0)?,
                    timestamp_ms: row.try_get(1)?,
                    name: row.try_get(2)?,
                    tags: row.try_get(3)?,
                    value: row.try_get(4)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    #[test]
    fn test_statements_are_schema_qualified() {
        let sql = StoreSql::new(&StorageConfig::default());
        expect![[r#"SELECT hash FROM metrics.labels WHERE metric = $1 ORDER BY date DESC LIMIT 1"#]]
            .assert_eq(&sql.find_hash);
        expect![[r#"SELECT md5($1)"#]].assert_eq(&sql.compute_hash);
        expect![[
            r#"INSERT INTO metrics.labels (date, hash, metric, name, val) VALUES (CURRENT_DATE, $1, $2, $3, $4)"#
        ]]
        .assert_eq(&sql.insert_label);
        expect![[r#"INSERT INTO metrics.hashes (hash, tags) VALUES ($1, $2)"#]]
            .assert_eq(&sql.insert_hash);
        expect![[
            r#"INSERT INTO metrics.samples (date, name, tags, hash, val, ts) VALUES (to_timestamp($5)::date, $1, $2, $3, $4, to_timestamp($5))"#
        ]]
        .assert_eq(&sql.insert_sample);
    }
}
