//! Remote-read query construction and series reassembly.

use std::hash::BuildHasherDefault;
use std::sync::Arc;

use indexmap::IndexMap;
use regex::Regex;
use rustc_hash::FxHasher;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::labels::{LABEL_SEP, METRIC_NAME_LABEL};
use crate::protocol::{self, LabelMatcher, MatchType, ReadRequest, ReadResponse};
use crate::store::{SeriesQuery, SqlParam, Store};

// See https://docs.rs/indexmap/latest/indexmap/#alternate-hashers
type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<FxHasher>>;

/// Time bucketing for one range query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start_secs: i64,
    pub end_secs: i64,
    pub bucket_secs: i64,
}

impl TimeWindow {
    /// Splits `[start, end]` into at most `max_samples` buckets, none
    /// narrower than `min_period_secs`. Both limits protect the result
    /// size and the aggregation cost at once.
    pub fn build(
        start_ms: i64,
        end_ms: i64,
        max_samples: i64,
        min_period_secs: i64,
    ) -> Result<Self> {
        if max_samples < 1 {
            return Err(Error::Config(format!(
                "max_samples must be positive, got {max_samples}"
            )));
        }
        let start_secs = start_ms / 1000;
        let end_secs = end_ms / 1000;
        if end_secs < start_secs {
            return Err(Error::InvalidTimeRange {
                start: start_ms,
                end: end_ms,
            });
        }
        let period = end_secs - start_secs;
        let bucket_secs = (period / max_samples).max(min_period_secs);
        Ok(Self {
            start_secs,
            end_secs,
            bucket_secs,
        })
    }

    /// Select fragment counting samples per bucket and flooring the
    /// sample time onto the bucket boundary, milliseconds out.
    fn select_fragment(&self) -> String {
        format!(
            "SELECT count(*) AS cnt, (floor(extract(epoch FROM ts) / {w})::bigint * {w}) * 1000 AS t",
            w = self.bucket_secs
        )
    }

    /// Inclusive time predicate, led by the calendar-date partition
    /// bounds.
    fn where_fragment(&self, params: &mut Vec<SqlParam>) -> String {
        let date_lo = bind(params, SqlParam::Int(self.start_secs));
        let ts_lo = bind(params, SqlParam::Int(self.start_secs));
        let ts_hi = bind(params, SqlParam::Int(self.end_secs));
        let date_hi = bind(params, SqlParam::Int(self.end_secs));
        format!(
            "WHERE date >= to_timestamp(${date_lo})::date AND ts >= to_timestamp(${ts_lo}) \
             AND ts <= to_timestamp(${ts_hi}) AND date <= to_timestamp(${date_hi})::date"
        )
    }
}

fn bind(params: &mut Vec<SqlParam>, param: SqlParam) -> usize {
    params.push(param);
    params.len()
}

/// Rewrites a user value pattern to match a rendered `name=value` tag.
///
/// Tags store the label name and value concatenated, so a `^` anchoring
/// the value start must anchor the whole rendered tag instead. The
/// rewritten pattern is validated before it is allowed near a query.
pub fn anchored_tag_pattern(name: &str, pattern: &str) -> Result<String> {
    let value_pattern = pattern.strip_prefix('^').unwrap_or(pattern);
    let full = format!("^{}={}", regex::escape(name), value_pattern);
    Regex::new(&full).map_err(|source| Error::MatcherRegex {
        name: name.to_owned(),
        source,
    })?;
    Ok(full)
}

/// `__name__` matchers compile straight against the name column.
fn name_predicate(matcher: &LabelMatcher, params: &mut Vec<SqlParam>) -> Result<String> {
    let predicate = match matcher.match_type() {
        MatchType::Equal => {
            format!("name = ${}", bind(params, SqlParam::Text(matcher.value.clone())))
        }
        MatchType::NotEqual => {
            format!("name != ${}", bind(params, SqlParam::Text(matcher.value.clone())))
        }
        MatchType::RegexMatch | MatchType::RegexNoMatch => {
            Regex::new(&matcher.value).map_err(|source| Error::MatcherRegex {
                name: matcher.name.clone(),
                source,
            })?;
            let idx = bind(params, SqlParam::Text(matcher.value.clone()));
            if matcher.match_type() == MatchType::RegexMatch {
                format!("name ~ ${idx}")
            } else {
                format!("name !~ ${idx}")
            }
        }
    };
    Ok(predicate)
}

/// Every other matcher compiles against the rendered tag array.
fn label_predicate(matcher: &LabelMatcher, params: &mut Vec<SqlParam>) -> Result<String> {
    match matcher.match_type() {
        MatchType::Equal | MatchType::NotEqual => {
            // the value may carry |-separated alternatives; one
            // membership test covers them all
            let rendered = matcher
                .value
                .split('|')
                .filter(|value| !value.is_empty())
                .map(|value| format!("{}={}", matcher.name, value))
                .collect::<Vec<_>>();
            let idx = bind(params, SqlParam::TextArray(rendered));
            Ok(match matcher.match_type() {
                MatchType::Equal => format!("tags && ${idx}"),
                _ => format!("NOT (tags && ${idx})"),
            })
        }
        MatchType::RegexMatch | MatchType::RegexNoMatch => {
            let pattern = anchored_tag_pattern(&matcher.name, &matcher.value)?;
            let idx = bind(params, SqlParam::Text(pattern));
            Ok(match matcher.match_type() {
                MatchType::RegexMatch => {
                    format!("EXISTS (SELECT FROM unnest(tags) AS tag WHERE tag ~ ${idx})")
                }
                _ => format!("NOT EXISTS (SELECT FROM unnest(tags) AS tag WHERE tag ~ ${idx})"),
            })
        }
    }
}

/// Translates decoded read requests into aggregate selects and merges
/// the result rows back into series.
pub struct Reader {
    store: Arc<dyn Store>,
    table: String,
    max_samples: i64,
    min_period_secs: i64,
    quantile: f64,
}

impl Reader {
    pub fn new(store: Arc<dyn Store>, config: &Config) -> Self {
        Self {
            store,
            table: format!("{}.{}", config.storage.schema, config.storage.table_samples),
            max_samples: config.read.max_samples,
            min_period_secs: config.read.min_period_secs,
            quantile: config.read.quantile,
        }
    }

    /// Compiles one sub-query into SQL plus its bound parameters.
    pub fn build(&self, query: &protocol::Query) -> Result<SeriesQuery> {
        let window = TimeWindow::build(
            query.start_timestamp_ms,
            query.end_timestamp_ms,
            self.max_samples,
            self.min_period_secs,
        )?;
        let mut params = Vec::new();
        let quantile = bind(&mut params, SqlParam::Float(self.quantile));
        let time_where = window.where_fragment(&mut params);

        let mut predicates = Vec::with_capacity(query.matchers.len());
        for matcher in &query.matchers {
            let predicate = if matcher.name == METRIC_NAME_LABEL {
                name_predicate(matcher, &mut params)?
            } else {
                label_predicate(matcher, &mut params)?
            };
            predicates.push(predicate);
        }
        let matcher_where = if predicates.is_empty() {
            String::new()
        } else {
            format!(" AND {}", predicates.join(" AND "))
        };

        let sql = format!(
            "{select}, name, tags, percentile_cont(${quantile}) WITHIN GROUP (ORDER BY val) \
             AS value FROM {table} {time_where}{matcher_where} GROUP BY t, name, tags ORDER BY t",
            select = window.select_fragment(),
            table = self.table,
        );
        Ok(SeriesQuery {
            sql,
            params,
            window,
            quantile: self.quantile,
            matchers: query.matchers.clone(),
        })
    }

    /// Runs every sub-query and merges the rows into one series
    /// collection; rows sharing a tag array fold into a single series
    /// across buckets and sub-queries. Any build or execution error
    /// aborts the whole read.
    pub async fn read(&self, request: &ReadRequest) -> Result<ReadResponse> {
        let mut series: FxIndexMap<String, protocol::TimeSeries> = FxIndexMap::default();
        let mut rows_scanned = 0usize;
        for query in &request.queries {
            let built = self.build(query)?;
            debug!(sql = %built.sql, "running range query");
            for row in self.store.select_series(&built).await? {
                rows_scanned += 1;
                let key = row.tags.join(LABEL_SEP);
                let entry = series.entry(key).or_insert_with(|| protocol::TimeSeries {
                    labels: labels_from_tags(&row.tags),
                    samples: Vec::new(),
                });
                entry.samples.push(protocol::Sample {
                    value: row.value,
                    timestamp: row.timestamp_ms,
                });
            }
        }
        debug!(
            rows = rows_scanned,
            queries = request.queries.len(),
            "read complete"
        );
        Ok(ReadResponse {
            results: vec![protocol::QueryResult {
                timeseries: series.into_values().collect(),
            }],
        })
    }
}

/// Unpacks rendered `name=value` tags back into wire labels. Malformed
/// tags and empty values are skipped.
fn labels_from_tags(tags: &[String]) -> Vec<protocol::Label> {
    let mut labels = Vec::with_capacity(tags.len());
    for tag in tags {
        let Some((name, value)) = tag.split_once('=') else {
            warn!(%tag, "malformed tag, skipping");
            continue;
        };
        if value.is_empty() {
            continue;
        }
        labels.push(protocol::Label {
            name: name.to_owned(),
            value: value.to_owned(),
        });
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use expect_test::expect;

    use crate::labels::Fingerprint;
    use crate::metric::Metric;
    use crate::store::{InsertOutcome, SeriesRow};

    struct FixedStore(Vec<SeriesRow>);

    #[async_trait]
    impl Store for FixedStore {
        async fn find_hash(&self, _: &Fingerprint) -> Result<Option<String>> {
            Ok(None)
        }
        async fn compute_hash(&self, _: &Fingerprint) -> Result<String> {
            Ok(String::new())
        }
        async fn create_metadata(&self, _: &[Metric]) -> Result<()> {
            Ok(())
        }
        async fn register_hashes(&self, _: &[Metric]) -> Result<()> {
            Ok(())
        }
        async fn insert_samples(&self, _: &[Metric]) -> Result<InsertOutcome> {
            Ok(InsertOutcome::default())
        }
        async fn select_series(&self, _: &SeriesQuery) -> Result<Vec<SeriesRow>> {
            Ok(self.0.clone())
        }
    }

    fn test_reader(rows: Vec<SeriesRow>) -> Reader {
        let mut config = Config::default();
        config.read.max_samples = 2;
        config.read.min_period_secs = 10;
        config.read.quantile = 0.75;
        Reader::new(Arc::new(FixedStore(rows)), &config)
    }

    fn matcher(match_type: MatchType, name: &str, value: &str) -> LabelMatcher {
        LabelMatcher {
            r#type: match_type as i32,
            name: name.to_owned(),
            value: value.to_owned(),
        }
    }

    #[test]
    fn test_time_window_rejects_reversed_range() {
        let err = TimeWindow::build(2000, 1000, 10, 10).unwrap_err();
        assert!(matches!(err, Error::InvalidTimeRange { .. }));
    }

    #[test]
    fn test_time_window_rejects_bad_max_samples() {
        assert!(TimeWindow::build(0, 1000, 0, 10).is_err());
    }

    #[test]
    fn test_time_window_zero_period_uses_min_period() {
        let window = TimeWindow::build(1000, 1000, 10, 15).unwrap();
        assert_eq!(window.start_secs, window.end_secs);
        assert_eq!(window.bucket_secs, 15);
    }

    #[test]
    fn test_time_window_divides_wide_periods() {
        // an hour in 60 buckets wants 60s buckets, not the 10s floor
        let window = TimeWindow::build(0, 3_600_000, 60, 10).unwrap();
        assert_eq!(window.bucket_secs, 60);

        // integer division, like the engine computes it
        let window = TimeWindow::build(0, 100_000, 3, 10).unwrap();
        assert_eq!(window.bucket_secs, 33);
    }

    #[test]
    fn test_regex_matcher_is_reanchored() {
        assert_eq!(anchored_tag_pattern("job", "^api$").unwrap(), "^job=api$");
        assert_eq!(anchored_tag_pattern("job", "api.*").unwrap(), "^job=api.*");
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        let err = anchored_tag_pattern("job", "(unclosed").unwrap_err();
        assert!(matches!(err, Error::MatcherRegex { .. }));

        let reader = test_reader(Vec::new());
        let query = protocol::Query {
            start_timestamp_ms: 0,
            end_timestamp_ms: 60_000,
            matchers: vec![matcher(MatchType::RegexMatch, METRIC_NAME_LABEL, "(")],
        };
        assert!(reader.build(&query).is_err());
    }

    #[test]
    fn test_build_query_snapshot() {
        let reader = test_reader(Vec::new());
        let query = protocol::Query {
            start_timestamp_ms: 1_700_000_010_000,
            end_timestamp_ms: 1_700_000_070_000,
            matchers: vec![
                matcher(MatchType::Equal, METRIC_NAME_LABEL, "cpu_seconds"),
                matcher(MatchType::Equal, "job", "api|web"),
                matcher(MatchType::RegexMatch, "instance", "^10\\..*"),
                matcher(MatchType::NotEqual, "zone", "us"),
                matcher(MatchType::RegexNoMatch, "host", "db.*"),
            ],
        };
        let built = reader.build(&query).unwrap();
        assert_eq!(built.window.bucket_secs, 30);
        expect![[r#"SELECT count(*) AS cnt, (floor(extract(epoch FROM ts) / 30)::bigint * 30) * 1000 AS t, name, tags, percentile_cont($1) WITHIN GROUP (ORDER BY val) AS value FROM metrics.samples WHERE date >= to_timestamp($2)::date AND ts >= to_timestamp($3) AND ts <= to_timestamp($4) AND date <= to_timestamp($5)::date AND name = $6 AND tags && $7 AND EXISTS (SELECT FROM unnest(tags) AS tag WHERE tag ~ $8) AND NOT (tags && $9) AND NOT EXISTS (SELECT FROM unnest(tags) AS tag WHERE tag ~ $10) GROUP BY t, name, tags ORDER BY t"#]]
        .assert_eq(&built.sql);
        expect![[r#"
            [
                Float(
                    0.75,
                ),
                Int(
                    1700000010,
                ),
                Int(
                    1700000010,
                ),
                Int(
                    1700000070,
                ),
                Int(
                    1700000070,
                ),
                Text(
                    "cpu_seconds",
                ),
                TextArray(
                    [
                        "job=api",
                        "job=web",
                    ],
                ),
                Text(
                    "^instance=10\\..*",
                ),
                TextArray(
                    [
                        "zone=us",
                    ],
                ),
                Text(
                    "^host=db.*",
                ),
            ]
        "#]]
        .assert_debug_eq(&built.params);
    }

    #[test]
    fn test_tags_reassemble_into_labels() {
        let tags = vec![
            "__name__=cpu".to_owned(),
            "job=api".to_owned(),
            "broken".to_owned(),
            "empty=".to_owned(),
        ];
        let labels = labels_from_tags(&tags);
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].name, "__name__");
        assert_eq!(labels[1].value, "api");
    }

    #[tokio::test]
    async fn test_read_merges_rows_into_series() {
        let api_tags = vec!["__name__=up".to_owned(), "job=api".to_owned()];
        let web_tags = vec!["__name__=up".to_owned(), "job=web".to_owned()];
        let rows = vec![
            SeriesRow {
                count: 1,
                timestamp_ms: 0,
                name: "up".to_owned(),
                tags: api_tags.clone(),
                value: 1.0,
            },
            SeriesRow {
                count: 2,
                timestamp_ms: 30_000,
                name: "up".to_owned(),
                tags: api_tags,
                value: 0.5,
            },
            SeriesRow {
                count: 1,
                timestamp_ms: 0,
                name: "up".to_owned(),
                tags: web_tags,
                value: 1.0,
            },
        ];
        let reader = test_reader(rows);
        let request = ReadRequest {
            queries: vec![protocol::Query {
                start_timestamp_ms: 0,
                end_timestamp_ms: 60_000,
                matchers: Vec::new(),
            }],
        };
        let response = reader.read(&request).await.unwrap();
        assert_eq!(response.results.len(), 1);
        let series = &response.results[0].timeseries;
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].samples.len(), 2);
        assert_eq!(series[0].samples[1].timestamp, 30_000);
        assert_eq!(series[0].labels[1].value, "api");
        assert_eq!(series[1].samples.len(), 1);
        assert_eq!(series[1].labels[1].value, "web");
    }
}
