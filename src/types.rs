//! Core data types used throughout the gateway
//!
//! # Key Types
//!
//! - **`MetricId`** / **`TagsetId`**: database-assigned identifiers (16-bit
//!   and 32-bit, matching the DDL column widths)
//! - **`Tagset`**: an immutable, canonically ordered set of tag pairs with a
//!   precomputed hash, used both as cache key and as the `jsonb` identity in
//!   the database
//! - **`DataPoint`**: a single incoming measurement

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

/// Database identifier for a metric (`metric.id smallint`)
pub type MetricId = i16;

/// Database identifier for a tagset (`tagset.id int`)
pub type TagsetId = i32;

/// An immutable set of tag key/value pairs in canonical (key-sorted) order
///
/// Two tagsets are equal iff they contain the same pairs, regardless of the
/// order they were built in. The hash is precomputed so the type is cheap to
/// use as a cache key.
#[derive(Debug, Clone)]
pub struct Tagset {
    /// Pairs sorted by key; keys are unique (last write wins on build)
    pairs: Vec<(String, String)>,
    hash: u64,
}

impl Tagset {
    /// Build a tagset from arbitrary pairs, canonicalizing the order
    pub fn new<I>(tags: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut pairs: Vec<(String, String)> = tags.into_iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        pairs.dedup_by(|a, b| a.0 == b.0);

        let mut hasher = DefaultHasher::new();
        pairs.hash(&mut hasher);
        let hash = hasher.finish();

        Self { pairs, hash }
    }

    /// Build a tagset from a JSON object (`{"host": "a", ...}`)
    ///
    /// Returns `None` when the value is not an object of strings, which is
    /// how malformed `tagset.tags` rows are rejected during cache refresh.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let object = value.as_object()?;
        let mut pairs = Vec::with_capacity(object.len());
        for (key, value) in object {
            pairs.push((key.clone(), value.as_str()?.to_string()));
        }
        Some(Self::new(pairs))
    }

    /// Look up the value for a tag key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|i| self.pairs[i].1.as_str())
    }

    /// Whether the tagset contains the given key
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of pairs
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether the tagset has no pairs
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Iterate pairs in canonical order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Iterate keys in canonical order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(k, _)| k.as_str())
    }

    /// The canonical JSON encoding (sorted keys), used as the `jsonb` value
    /// stored in the database and as the ingest cache key
    pub fn canonical_json(&self) -> String {
        self.to_json().to_string()
    }

    /// The tagset as a JSON object value
    pub fn to_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        for (key, value) in &self.pairs {
            object.insert(key.clone(), serde_json::Value::String(value.clone()));
        }
        serde_json::Value::Object(object)
    }

    /// The tagset as an owned string map
    pub fn to_map(&self) -> HashMap<String, String> {
        self.pairs.iter().cloned().collect()
    }
}

impl PartialEq for Tagset {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.pairs == other.pairs
    }
}

impl Eq for Tagset {}

impl Hash for Tagset {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Display for Tagset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_json())
    }
}

impl Serialize for Tagset {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter())
    }
}

impl FromIterator<(String, String)> for Tagset {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// A single incoming measurement, already validated and time-normalized
#[derive(Debug, Clone)]
pub struct DataPoint {
    /// Metric name
    pub metric: String,
    /// Measurement instant (microsecond resolution)
    pub time: DateTime<Utc>,
    /// Measurement value
    pub value: f64,
    /// Tags identifying the series within the metric
    pub tags: Tagset,
}

/// Decode an OpenTSDB epoch timestamp
///
/// Values at or below 10^10 are seconds (fractions allowed); larger values
/// are milliseconds. Returns `None` for non-finite input or values outside
/// the representable range.
pub fn datetime_from_epoch(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() {
        return None;
    }
    let seconds = if raw.abs() > 1e10 { raw / 1000.0 } else { raw };
    let micros = (seconds * 1_000_000.0).round();
    if micros.abs() > i64::MAX as f64 {
        return None;
    }
    match Utc.timestamp_micros(micros as i64) {
        chrono::LocalResult::Single(dt) => Some(dt),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagset_canonical_order() {
        let a = Tagset::new(vec![
            ("host".to_string(), "web1".to_string()),
            ("dc".to_string(), "ams".to_string()),
        ]);
        let b = Tagset::new(vec![
            ("dc".to_string(), "ams".to_string()),
            ("host".to_string(), "web1".to_string()),
        ]);

        assert_eq!(a, b);
        assert_eq!(a.canonical_json(), r#"{"dc":"ams","host":"web1"}"#);
    }

    #[test]
    fn test_tagset_hash_equality() {
        use std::collections::HashMap;

        let a = Tagset::new(vec![("host".to_string(), "web1".to_string())]);
        let b = Tagset::new(vec![("host".to_string(), "web1".to_string())]);

        let mut map = HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get(&b), Some(&1));
    }

    #[test]
    fn test_tagset_get() {
        let tags = Tagset::new(vec![
            ("host".to_string(), "web1".to_string()),
            ("dc".to_string(), "ams".to_string()),
        ]);

        assert_eq!(tags.get("host"), Some("web1"));
        assert_eq!(tags.get("dc"), Some("ams"));
        assert_eq!(tags.get("rack"), None);
    }

    #[test]
    fn test_tagset_from_json() {
        let value = serde_json::json!({"host": "web1", "dc": "ams"});
        let tags = Tagset::from_json(&value).unwrap();
        assert_eq!(tags.get("host"), Some("web1"));

        assert!(Tagset::from_json(&serde_json::json!(["host"])).is_none());
        assert!(Tagset::from_json(&serde_json::json!({"host": 1})).is_none());
    }

    #[test]
    fn test_epoch_seconds_vs_millis() {
        // 2021-01-01T00:00:00Z
        let secs = datetime_from_epoch(1_609_459_200.0).unwrap();
        let millis = datetime_from_epoch(1_609_459_200_000.0).unwrap();
        assert_eq!(secs, millis);
        assert_eq!(secs.timestamp(), 1_609_459_200);
    }

    #[test]
    fn test_epoch_fractional_seconds() {
        let dt = datetime_from_epoch(1_609_459_200.5).unwrap();
        assert_eq!(dt.timestamp_subsec_micros(), 500_000);
    }

    #[test]
    fn test_epoch_rejects_non_finite() {
        assert!(datetime_from_epoch(f64::NAN).is_none());
        assert!(datetime_from_epoch(f64::INFINITY).is_none());
    }
}
