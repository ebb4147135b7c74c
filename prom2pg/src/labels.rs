use itertools::Itertools;
use serde::ser::{Serialize, SerializeMap, Serializer};

/// Reserved label holding the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Separator joining rendered `name=value` pairs into a fingerprint and
/// into series merge keys. Not expected to occur in label text.
pub const LABEL_SEP: &str = "\u{ff}";

/// Label is a key/value pair of strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub name: String,
    pub value: String,
}

/// `Labels` is a sorted set of `Label`s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: AsRef<str>,
    {
        let mut labels = labels
            .into_iter()
            .map(|(k, v)| Label {
                name: k.as_ref().to_owned(),
                value: v.as_ref().to_owned(),
            })
            .collect::<Vec<_>>();
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        assert!(
            !labels.windows(2).any(|w| w[0].name == w[1].name),
            "label names are not unique"
        );
        Self(labels)
    }

    /// Returns the value of the label with given name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by_key(&name, |label| label.name.as_str())
            .ok()
            .map(|index| self.0[index].value.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every label rendered as `name=value`, sorted lexicographically on
    /// the rendered string. This is the tag-array representation stored
    /// next to each sample, and the material the fingerprint is built
    /// from.
    pub fn rendered(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|label| format!("{}={}", label.name, label.value))
            .sorted()
            .collect()
    }

    /// Order-independent cache key for this label set. Two label sets
    /// with the same pairs fingerprint identically no matter how they
    /// arrived; the fingerprint is never the persisted key.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(self.rendered().join(LABEL_SEP))
    }
}

impl Serialize for Labels {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for label in &self.0 {
            map.serialize_entry(&label.name, &label.value)?;
        }
        map.end()
    }
}

/// Deterministic lookup key derived from a label set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<Fingerprint> for String {
    fn from(fingerprint: Fingerprint) -> Self {
        fingerprint.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    #[test]
    fn test_labels() {
        let labels = Labels::new([("b", "1"), ("a", "2"), ("c", "2")]);
        expect![[r#"
            Labels(
                [
                    Label {
                        name: "a",
                        value: "2",
                    },
                    Label {
                        name: "b",
                        value: "1",
                    },
                    Label {
                        name: "c",
                        value: "2",
                    },
                ],
            )
        "#]]
        .assert_debug_eq(&labels);
    }

    #[test]
    #[should_panic]
    fn test_labels_not_unique() {
        Labels::new([("b", "1"), ("a", "2"), ("a", "3"), ("a", "2")]);
    }

    #[test]
    fn test_labels_get() {
        let labels = Labels::new([("a", "1"), ("b", "2")]);
        assert_eq!(labels.get("b"), Some("2"));
        assert!(labels.get("x").is_none());
    }

    #[test]
    fn test_fingerprint_order_independent() {
        let a = Labels::new([("job", "api"), ("__name__", "cpu_seconds")]);
        let b = Labels::new([("__name__", "cpu_seconds"), ("job", "api")]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(
            a.fingerprint().as_str(),
            "__name__=cpu_seconds\u{ff}job=api"
        );
    }

    #[test]
    fn test_fingerprint_sensitive_to_any_pair() {
        let base = Labels::new([("job", "api"), ("zone", "eu")]);
        let renamed = Labels::new([("job2", "api"), ("zone", "eu")]);
        let revalued = Labels::new([("job", "web"), ("zone", "eu")]);
        assert_ne!(base.fingerprint(), renamed.fingerprint());
        assert_ne!(base.fingerprint(), revalued.fingerprint());
    }

    #[test]
    fn test_rendered_sorts_rendered_pairs() {
        // `a0` sorts after `a` by name but before `a=...` once rendered,
        // because '0' < '='
        let labels = Labels::new([("a", "2"), ("a0", "1")]);
        expect![[r#"
            [
                "a0=1",
                "a=2",
            ]
        "#]]
        .assert_debug_eq(&labels.rendered());
    }

    #[test]
    fn test_labels_serialize() {
        let labels = Labels::new([("b", "1"), ("a", "2"), ("c", "2")]);
        expect![[r#"
            {
              "a": "2",
              "b": "1",
              "c": "2"
            }"#]]
        .assert_eq(&serde_json::to_string_pretty(&labels).unwrap());
    }
}
