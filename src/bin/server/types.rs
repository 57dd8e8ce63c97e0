//! Request and response types for the OpenTSDB-compatible HTTP API

use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use tsgate::query::QuerySeries;

// =============================================================================
// Write API
// =============================================================================

/// A single incoming data point (`/api/put`)
#[derive(Debug, Deserialize)]
pub struct DataPointDto {
    /// Metric name
    pub metric: String,
    /// Epoch timestamp: seconds (fractions allowed) or milliseconds when
    /// larger than 10^10
    pub timestamp: f64,
    /// Value
    pub value: f64,
    /// Tags; at least one pair is required
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// `/api/put` accepts a single point or an array, like OpenTSDB
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PutBody {
    /// One point
    Single(DataPointDto),
    /// A batch
    Many(Vec<DataPointDto>),
}

impl PutBody {
    /// Flatten into a batch
    pub fn into_points(self) -> Vec<DataPointDto> {
        match self {
            Self::Single(point) => vec![point],
            Self::Many(points) => points,
        }
    }
}

// =============================================================================
// Query API
// =============================================================================

/// `/api/query` request body
#[derive(Debug, Deserialize)]
pub struct QueryDto {
    /// Start of the window
    pub start: tsgate::query::time::TimeSpec,
    /// End of the window; defaults to now
    #[serde(default)]
    pub end: Option<tsgate::query::time::TimeSpec>,
    /// Subqueries
    pub queries: Vec<QueryPartDto>,
}

/// One subquery
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPartDto {
    /// Metric name
    pub metric: String,
    /// Inline tags; every entry becomes a group-by filter
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Cross-series aggregator name, or "none"
    #[serde(default)]
    pub aggregator: Option<String>,
    /// Whether to rate-convert the series
    #[serde(default)]
    pub rate: bool,
    /// Counter options for rate conversion
    #[serde(default)]
    pub rate_options: Option<RateOptionsDto>,
    /// Downsample wire form, e.g. `1m-avg-zero`
    #[serde(default)]
    pub downsample: Option<String>,
    /// Explicit filters
    #[serde(default)]
    pub filters: Vec<FilterDto>,
    /// Only match tagsets whose keys are exactly the filtered keys
    #[serde(default)]
    pub explicit_tags: bool,
}

/// OpenTSDB `rateOptions`
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateOptionsDto {
    /// Treat the series as a monotonic counter
    #[serde(default)]
    pub counter: bool,
    /// Counter maximum before rollover
    #[serde(default)]
    pub counter_max: Option<f64>,
    /// Suppress points at counter resets
    #[serde(default)]
    pub drop_resets: bool,
}

impl RateOptionsDto {
    /// Convert to the pipeline's options
    pub fn into_options(self) -> tsgate::query::rate::RateOptions {
        let defaults = tsgate::query::rate::RateOptions::default();
        tsgate::query::rate::RateOptions {
            counter: self.counter,
            counter_max: self.counter_max.unwrap_or(defaults.counter_max),
            drop_resets: self.drop_resets,
        }
    }
}

/// One explicit filter
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterDto {
    /// Filter kind name (`literal_or`, `iwildcard`, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Tag key the filter applies to
    pub tagk: String,
    /// Filter expression
    pub filter: String,
    /// Whether this key is a grouping axis
    #[serde(default)]
    pub group_by: bool,
}

/// One emitted series (`/api/query` response element)
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResultDto {
    /// Metric name
    pub metric: String,
    /// Series tags
    pub tags: BTreeMap<String, String>,
    /// Tag keys aggregated away
    pub aggregate_tags: Vec<String>,
    /// Datapoints keyed by unix seconds
    pub dps: Dps,
}

impl From<QuerySeries> for QueryResultDto {
    fn from(series: QuerySeries) -> Self {
        Self {
            metric: series.metric,
            tags: series.tags,
            aggregate_tags: series.aggregate_tags,
            dps: Dps(series.dps),
        }
    }
}

/// Datapoint map rendering `{unixSeconds: number | null | "NaN"}`
///
/// JSON has no NaN literal, so NaN-filled buckets serialize as the string
/// `"NaN"` (OpenTSDB parity); null-filled buckets serialize as JSON null.
#[derive(Debug)]
pub struct Dps(pub Vec<(i64, Option<f64>)>);

impl Serialize for Dps {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (ts, value) in &self.0 {
            let key = ts.to_string();
            match value {
                None => map.serialize_entry(&key, &Option::<f64>::None)?,
                Some(v) if v.is_nan() => map.serialize_entry(&key, "NaN")?,
                Some(v) => map.serialize_entry(&key, v)?,
            }
        }
        map.end()
    }
}

// =============================================================================
// Last-point API
// =============================================================================

/// `/api/query/last` request body
#[derive(Debug, Deserialize)]
pub struct LastQueryDto {
    /// Subqueries
    pub queries: Vec<LastQueryPartDto>,
}

/// One last-point subquery
#[derive(Debug, Deserialize)]
pub struct LastQueryPartDto {
    /// Metric name
    pub metric: String,
    /// Inline tags restricting the series
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// One last-point result
#[derive(Debug, Serialize)]
pub struct LastQueryResultDto {
    /// Metric name
    pub metric: String,
    /// Series tags (resolved from the cache; unknown tagsets are skipped)
    pub tags: BTreeMap<String, String>,
    /// Timestamp in milliseconds
    pub timestamp: i64,
    /// Latest value
    pub value: f64,
}

// =============================================================================
// Lookup API
// =============================================================================

/// `/api/search/lookup` request body
#[derive(Debug, Deserialize)]
pub struct LookupRequestDto {
    /// Metric name or glob (`*` scans all metrics)
    pub metric: String,
    /// Tag pair constraints; `*` wildcards either side
    #[serde(default)]
    pub tags: Vec<LookupTagDto>,
    /// Maximum results returned
    #[serde(default)]
    pub limit: Option<usize>,
}

/// One lookup tag constraint
#[derive(Debug, Deserialize)]
pub struct LookupTagDto {
    /// Tag key, or `*`
    pub key: String,
    /// Tag value, or `*`
    pub value: String,
}

/// `/api/search/lookup` response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupResponseDto {
    /// Constant "LOOKUP"
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Echo of the requested metric
    pub metric: String,
    /// Matching series
    pub results: Vec<LookupResultDto>,
    /// Total matches before the limit was applied
    pub total_results: usize,
}

/// One lookup match
#[derive(Debug, Serialize)]
pub struct LookupResultDto {
    /// Metric name
    pub metric: String,
    /// Series tags
    pub tags: BTreeMap<String, String>,
}

// =============================================================================
// Suggest API
// =============================================================================

/// `/api/suggest` query string
#[derive(Debug, Deserialize)]
pub struct SuggestParams {
    /// `metrics`, `tagk`, or `tagv`
    #[serde(rename = "type")]
    pub kind: String,
    /// Prefix to match
    #[serde(default)]
    pub q: String,
    /// Maximum suggestions
    #[serde(default = "default_suggest_max")]
    pub max: usize,
}

pub fn default_suggest_max() -> usize {
    25
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dps_serialization() {
        let dps = Dps(vec![
            (100, Some(1.5)),
            (160, None),
            (220, Some(f64::NAN)),
        ]);
        let json = serde_json::to_string(&dps).unwrap();
        assert_eq!(json, r#"{"100":1.5,"160":null,"220":"NaN"}"#);
    }

    #[test]
    fn test_put_body_accepts_single_and_array() {
        let single: PutBody = serde_json::from_str(
            r#"{"metric":"cpu","timestamp":1600000000,"value":1.0,"tags":{"host":"a"}}"#,
        )
        .unwrap();
        assert_eq!(single.into_points().len(), 1);

        let many: PutBody = serde_json::from_str(
            r#"[{"metric":"cpu","timestamp":1600000000,"value":1.0,"tags":{"host":"a"}},
                {"metric":"cpu","timestamp":1600000001,"value":2.0,"tags":{"host":"b"}}]"#,
        )
        .unwrap();
        assert_eq!(many.into_points().len(), 2);
    }

    #[test]
    fn test_query_dto_decoding() {
        let dto: QueryDto = serde_json::from_str(
            r#"{
                "start": "1h-ago",
                "queries": [{
                    "metric": "cpu",
                    "aggregator": "avg",
                    "tags": {"host": "*"},
                    "downsample": "1m-avg",
                    "rate": true,
                    "rateOptions": {"counter": true, "counterMax": 65535, "dropResets": true},
                    "filters": [{"type": "literal_or", "tagk": "dc", "filter": "ams|fra", "groupBy": true}],
                    "explicitTags": false
                }]
            }"#,
        )
        .unwrap();

        let part = &dto.queries[0];
        assert_eq!(part.metric, "cpu");
        assert_eq!(part.aggregator.as_deref(), Some("avg"));
        assert!(part.rate);
        let options = part.rate_options.unwrap();
        assert!(options.counter);
        assert_eq!(options.counter_max, Some(65535.0));
        assert!(options.drop_resets);
        assert_eq!(part.filters.len(), 1);
        assert!(part.filters[0].group_by);
    }
}
