use crate::labels::{Fingerprint, Labels, METRIC_NAME_LABEL};
use crate::protocol::{Sample, TimeSeries};

/// One inbound series on its way to storage.
///
/// Built per series of a write request, consumed once its samples are
/// queued for insert; never persisted itself.
#[derive(Debug, Clone)]
pub struct Metric {
    pub labels: Labels,
    pub fingerprint: Fingerprint,
    /// Stable store identifier; populated from the cache or by the
    /// registry before the metric reaches the sample writer.
    pub hash: Option<String>,
    pub samples: Vec<Sample>,
}

impl Metric {
    pub fn from_series(series: &TimeSeries) -> Self {
        let labels = Labels::new(
            series
                .labels
                .iter()
                .map(|label| (label.name.as_str(), label.value.as_str())),
        );
        let fingerprint = labels.fingerprint();
        Self {
            labels,
            fingerprint,
            hash: None,
            samples: series.samples.clone(),
        }
    }

    pub fn name(&self) -> &str {
        self.labels.get(METRIC_NAME_LABEL).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Label;

    #[test]
    fn test_from_series() {
        let series = TimeSeries {
            labels: vec![
                Label {
                    name: "job".to_owned(),
                    value: "api".to_owned(),
                },
                Label {
                    name: "__name__".to_owned(),
                    value: "cpu_seconds".to_owned(),
                },
            ],
            samples: vec![Sample {
                value: 1.5,
                timestamp: 1_700_000_010_000,
            }],
        };
        let metric = Metric::from_series(&series);
        assert_eq!(metric.name(), "cpu_seconds");
        assert!(metric.hash.is_none());
        assert_eq!(metric.samples.len(), 1);
        assert_eq!(
            metric.fingerprint.as_str(),
            "__name__=cpu_seconds\u{ff}job=api"
        );
    }
}
