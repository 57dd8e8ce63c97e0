//! Query pipeline: filters -> SQL -> row stream -> grouping -> folds -> rate
//!
//! Each subquery resolves its candidate tagsets against the in-memory cache,
//! streams matching rows out of TimescaleDB, and emits series over a bounded
//! channel. Emission is back-pressured through the HTTP writer; a dropped
//! receiver cancels the pipeline at the next row.
//!
//! Aggregated subqueries without an explicit downsample run through the
//! downsample builder with the `all` sentinel and the aggregator's own
//! function, collapsing the window into one bucket per series before the
//! cross-series fold.

pub mod aggregator;
pub mod downsample;
pub mod rate;
pub mod time;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::TryStreamExt;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::mpsc;

use crate::cache::TagsetCache;
use crate::error::QueryError;
use crate::filter::{QueryFilter, TagPredicate};
use crate::types::{MetricId, Tagset, TagsetId};

use aggregator::{Aggregator, AggregatorKind};
use downsample::{ceil_to_bucket, Downsample, FillPolicy};
use rate::{RateConverter, RateOptions};

// ============================================================================
// Request and result shapes
// ============================================================================

/// Resolved query window
#[derive(Debug, Clone, Copy)]
pub struct QueryRange {
    /// Inclusive start
    pub start: DateTime<Utc>,
    /// End bound (defaulted to now upstream when absent)
    pub end: DateTime<Utc>,
}

/// One normalized subquery
#[derive(Debug, Clone)]
pub struct SubQuery {
    /// Metric name
    pub metric: String,
    /// Cross-series aggregator; `None` means every series is emitted alone
    pub aggregator: Option<AggregatorKind>,
    /// Optional per-series downsample
    pub downsample: Option<Downsample>,
    /// Whether to rate-convert emitted series
    pub rate: bool,
    /// Counter options for rate conversion
    pub rate_options: RateOptions,
    /// Resolved filters (inline tags included, marked `group_by`)
    pub filters: Vec<QueryFilter>,
    /// Restrict candidates to tagsets with exactly the filtered keys
    pub explicit_tags: bool,
}

/// One emitted series
#[derive(Debug, Clone)]
pub struct QuerySeries {
    /// Metric name
    pub metric: String,
    /// Literal tags (none-aggregated) or the member intersection (grouped)
    pub tags: BTreeMap<String, String>,
    /// Tag keys aggregated away (union minus intersection), sorted
    pub aggregate_tags: Vec<String>,
    /// (unix seconds, value) pairs; `None` renders as JSON null
    pub dps: Vec<(i64, Option<f64>)>,
}

/// A `query/last` result row
#[derive(Debug, Clone)]
pub struct LastPoint {
    /// Metric name
    pub metric: String,
    /// Tags of the series, resolved from the cache
    pub tags: BTreeMap<String, String>,
    /// Timestamp of the latest point (milliseconds, OpenTSDB parity)
    pub timestamp_ms: i64,
    /// Latest value
    pub value: f64,
}

/// A `search/lookup` result row
#[derive(Debug, Clone)]
pub struct LookupEntry {
    /// Metric name
    pub metric: String,
    /// Tags of the series
    pub tags: BTreeMap<String, String>,
}

// ============================================================================
// Engine
// ============================================================================

/// The query pipeline over a pool and the shared tagset cache
pub struct QueryEngine {
    pool: PgPool,
    cache: Arc<TagsetCache>,
}

impl QueryEngine {
    /// Create an engine
    pub fn new(pool: PgPool, cache: Arc<TagsetCache>) -> Self {
        Self { pool, cache }
    }

    /// Execute all subqueries, emitting series into `tx` as they complete
    ///
    /// Returns `QueryError::Canceled` when the receiver goes away.
    pub async fn run(
        &self,
        range: QueryRange,
        queries: Vec<SubQuery>,
        tx: mpsc::Sender<QuerySeries>,
    ) -> Result<(), QueryError> {
        for query in &queries {
            self.run_subquery(range, query, &tx).await?;
        }
        Ok(())
    }

    async fn run_subquery(
        &self,
        range: QueryRange,
        query: &SubQuery,
        tx: &mpsc::Sender<QuerySeries>,
    ) -> Result<(), QueryError> {
        let tagsets = self.cache.store().get_tagsets(
            std::slice::from_ref(&query.metric),
            &query.filters,
            query.explicit_tags,
        );
        if tagsets.is_empty() {
            return Ok(());
        }
        let Some(metric_id) = self.metric_id(&query.metric).await? else {
            return Ok(());
        };

        // Rate needs a predecessor for the first in-range point
        let scan_start = if query.rate {
            range.start - Duration::hours(1)
        } else {
            range.start
        };

        let downsample = match (&query.downsample, query.aggregator) {
            (Some(ds), _) => Some(ds.clone()),
            (None, Some(kind)) => Some(Downsample::all(kind)),
            (None, None) => None,
        };

        let ids: Vec<TagsetId> = tagsets.keys().copied().collect();
        let rows = build_row_query(
            metric_id,
            ids,
            scan_start,
            range,
            downsample.as_ref(),
            query.aggregator.is_none(),
        );

        if let Some(kind) = query.aggregator {
            self.consume_grouped(range, query, &tagsets, kind, downsample.as_ref(), rows, tx)
                .await
        } else {
            self.consume_per_series(range, query, &tagsets, downsample.as_ref(), rows, tx)
                .await
        }
    }

    /// Aggregated path: fold rows into per-(group, bucket) aggregators
    #[allow(clippy::too_many_arguments)]
    async fn consume_grouped(
        &self,
        range: QueryRange,
        query: &SubQuery,
        tagsets: &HashMap<TagsetId, Arc<Tagset>>,
        kind: AggregatorKind,
        downsample: Option<&Downsample>,
        rows: RowQuery,
        tx: &mpsc::Sender<QuerySeries>,
    ) -> Result<(), QueryError> {
        let lookup = TagsetGroupLookup::new(tagsets, &query.filters);
        let mut buckets: HashMap<usize, BTreeMap<DateTime<Utc>, Aggregator>> = HashMap::new();

        let mut stream = rows.fetch(&self.pool);
        while let Some(row) = stream.try_next().await? {
            if tx.is_closed() {
                return Err(QueryError::Canceled);
            }
            let bucket: DateTime<Utc> = row.try_get("bucket")?;
            let tagset_id: TagsetId = row.try_get("tagset_id")?;
            let value: Option<f64> = row.try_get("value")?;

            let Some(group) = lookup.group_of(tagset_id) else {
                continue;
            };
            buckets
                .entry(group)
                .or_default()
                .entry(bucket)
                .or_insert_with(|| Aggregator::new(kind))
                .add(value);
        }
        drop(stream);

        let fill = downsample.map(|ds| ds.fill).unwrap_or_default();
        for (group, series_buckets) in lookup.into_groups(buckets) {
            let mut dps = Vec::with_capacity(series_buckets.len());
            if query.rate {
                let mut conv = RateConverter::new(query.rate_options, range.start);
                for (bucket, mut agg) in series_buckets {
                    if let Some(value) = agg.result() {
                        if let Some(rate) = conv.try_calc(bucket, value) {
                            dps.push((bucket.timestamp(), Some(rate)));
                        }
                    }
                }
            } else {
                for (bucket, mut agg) in series_buckets {
                    push_bucket(&mut dps, bucket, agg.result(), fill);
                }
            }

            let series = QuerySeries {
                metric: query.metric.clone(),
                tags: group.tags,
                aggregate_tags: group.aggregate_tags,
                dps,
            };
            if tx.send(series).await.is_err() {
                return Err(QueryError::Canceled);
            }
        }
        Ok(())
    }

    /// Non-aggregated path: segment the SQL-ordered rows by tagset
    async fn consume_per_series(
        &self,
        range: QueryRange,
        query: &SubQuery,
        tagsets: &HashMap<TagsetId, Arc<Tagset>>,
        downsample: Option<&Downsample>,
        rows: RowQuery,
        tx: &mpsc::Sender<QuerySeries>,
    ) -> Result<(), QueryError> {
        let fill = downsample.map(|ds| ds.fill).unwrap_or_default();
        let mut current: Option<(TagsetId, Vec<(DateTime<Utc>, Option<f64>)>)> = None;

        let mut stream = rows.fetch(&self.pool);
        while let Some(row) = stream.try_next().await? {
            if tx.is_closed() {
                return Err(QueryError::Canceled);
            }
            let bucket: DateTime<Utc> = row.try_get("bucket")?;
            let tagset_id: TagsetId = row.try_get("tagset_id")?;
            let value: Option<f64> = row.try_get("value")?;

            match &mut current {
                Some((id, points)) if *id == tagset_id => points.push((bucket, value)),
                _ => {
                    if let Some((id, points)) = current.take() {
                        self.emit_series(range, query, tagsets, id, points, fill, tx)
                            .await?;
                    }
                    current = Some((tagset_id, vec![(bucket, value)]));
                }
            }
        }
        drop(stream);

        if let Some((id, points)) = current.take() {
            self.emit_series(range, query, tagsets, id, points, fill, tx)
                .await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit_series(
        &self,
        range: QueryRange,
        query: &SubQuery,
        tagsets: &HashMap<TagsetId, Arc<Tagset>>,
        tagset_id: TagsetId,
        points: Vec<(DateTime<Utc>, Option<f64>)>,
        fill: FillPolicy,
        tx: &mpsc::Sender<QuerySeries>,
    ) -> Result<(), QueryError> {
        let Some(tags) = tagsets.get(&tagset_id) else {
            return Ok(());
        };

        let mut dps = Vec::with_capacity(points.len());
        if query.rate {
            let mut conv = RateConverter::new(query.rate_options, range.start);
            for (t, value) in points {
                if let Some(value) = value {
                    if let Some(rate) = conv.try_calc(t, value) {
                        dps.push((t.timestamp(), Some(rate)));
                    }
                }
            }
        } else {
            for (t, value) in points {
                push_bucket(&mut dps, t, value, fill);
            }
        }

        let series = QuerySeries {
            metric: query.metric.clone(),
            tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            aggregate_tags: Vec::new(),
            dps,
        };
        if tx.send(series).await.is_err() {
            return Err(QueryError::Canceled);
        }
        Ok(())
    }

    /// Latest point per matching series, for `query/last`
    ///
    /// Results stream into `tx` as rows arrive, one subquery after another.
    /// Returns `QueryError::Canceled` when the receiver goes away.
    pub async fn run_last(
        &self,
        queries: Vec<(String, Vec<QueryFilter>)>,
        tx: mpsc::Sender<LastPoint>,
    ) -> Result<(), QueryError> {
        for (metric, filters) in &queries {
            self.last_subquery(metric, filters, &tx).await?;
        }
        Ok(())
    }

    async fn last_subquery(
        &self,
        metric: &str,
        filters: &[QueryFilter],
        tx: &mpsc::Sender<LastPoint>,
    ) -> Result<(), QueryError> {
        let tagsets =
            self.cache
                .store()
                .get_tagsets(std::slice::from_ref(&metric.to_string()), filters, false);
        if tagsets.is_empty() {
            return Ok(());
        }
        let Some(metric_id) = self.metric_id(metric).await? else {
            return Ok(());
        };
        let ids: Vec<TagsetId> = tagsets.keys().copied().collect();

        let mut rows = sqlx::query(
            "SELECT DISTINCT ON (tagset_id) tagset_id, time, value \
             FROM point \
             WHERE metric_id = $1 AND tagset_id = ANY($2) \
             ORDER BY tagset_id, time DESC",
        )
        .bind(metric_id)
        .bind(&ids)
        .fetch(&self.pool);

        while let Some(row) = rows.try_next().await? {
            if tx.is_closed() {
                return Err(QueryError::Canceled);
            }
            let tagset_id: TagsetId = row.try_get("tagset_id")?;
            let time: DateTime<Utc> = row.try_get("time")?;
            let value: f64 = row.try_get("value")?;
            // A tagset created between cache refreshes is unknown here; skip
            // it rather than erroring.
            let Some(tags) = self.cache.store().tagset(tagset_id) else {
                continue;
            };
            let point = LastPoint {
                metric: metric.to_string(),
                tags: tags
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                timestamp_ms: time.timestamp_millis(),
                value,
            };
            if tx.send(point).await.is_err() {
                return Err(QueryError::Canceled);
            }
        }
        Ok(())
    }

    /// Series lookup over the cache only (no database access)
    ///
    /// `metric` may be `"*"` (or any glob) to scan all metrics; a tag pair
    /// with value `"*"` requires the key with any value, and a pair with key
    /// `"*"` requires any key carrying the value.
    pub fn lookup(
        &self,
        metric: &str,
        pairs: &[(String, String)],
        limit: usize,
    ) -> Result<(Vec<LookupEntry>, usize), QueryError> {
        let store = self.cache.store();
        let metric_names: Vec<String> = if metric.contains('*') {
            let predicate = TagPredicate::from_tag_value(metric)?;
            store
                .metric_names("", usize::MAX)
                .into_iter()
                .filter(|name| predicate.matches(name))
                .collect()
        } else {
            vec![metric.to_string()]
        };

        let mut keyed_filters = Vec::new();
        let mut any_key_values = Vec::new();
        for (key, value) in pairs {
            if key == "*" {
                any_key_values.push(TagPredicate::from_tag_value(value)?);
            } else {
                keyed_filters.push(QueryFilter::new(
                    key.clone(),
                    TagPredicate::from_tag_value(value)?,
                    false,
                ));
            }
        }

        let mut entries = Vec::new();
        for name in metric_names {
            let metrics = [name.clone()];
            let mut matches: Vec<(TagsetId, Arc<Tagset>)> = store
                .get_tagsets(&metrics, &keyed_filters, false)
                .into_iter()
                .filter(|(_, tags)| {
                    any_key_values
                        .iter()
                        .all(|p| tags.iter().any(|(_, v)| p.matches(v)))
                })
                .collect();
            matches.sort_by_key(|(id, _)| *id);
            for (_, tags) in matches {
                entries.push(LookupEntry {
                    metric: name.clone(),
                    tags: tags
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                });
            }
        }

        let total = entries.len();
        entries.truncate(limit);
        Ok((entries, total))
    }

    async fn metric_id(&self, name: &str) -> Result<Option<MetricId>, QueryError> {
        let id = sqlx::query_scalar("SELECT id FROM metric WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }
}

fn push_bucket(
    dps: &mut Vec<(i64, Option<f64>)>,
    bucket: DateTime<Utc>,
    value: Option<f64>,
    fill: FillPolicy,
) {
    match value {
        Some(v) => dps.push((bucket.timestamp(), Some(v))),
        None => match fill {
            FillPolicy::Zero => dps.push((bucket.timestamp(), Some(0.0))),
            FillPolicy::Nan => dps.push((bucket.timestamp(), Some(f64::NAN))),
            FillPolicy::Null => dps.push((bucket.timestamp(), None)),
            FillPolicy::None => {}
        },
    }
}

// ============================================================================
// Tagset grouping
// ============================================================================

/// Grouped series metadata: the member intersection and the keys folded away
#[derive(Debug)]
struct GroupOutput {
    tags: BTreeMap<String, String>,
    aggregate_tags: Vec<String>,
}

/// Maps candidate tagset ids to groups keyed by the values at the
/// `group_by = true` filter keys
struct TagsetGroupLookup {
    group_of: HashMap<TagsetId, usize>,
    /// Group key -> index, kept for deterministic output ordering
    order: Vec<(Vec<Option<String>>, usize)>,
    outputs: Vec<GroupOutput>,
}

impl TagsetGroupLookup {
    fn new(tagsets: &HashMap<TagsetId, Arc<Tagset>>, filters: &[QueryFilter]) -> Self {
        let group_keys: Vec<&str> = filters
            .iter()
            .filter(|f| f.group_by)
            .map(|f| f.key.as_str())
            .collect();

        let mut index: HashMap<Vec<Option<String>>, usize> = HashMap::new();
        let mut group_of = HashMap::with_capacity(tagsets.len());
        let mut outputs: Vec<GroupOutput> = Vec::new();
        let mut all_keys: Vec<HashSet<String>> = Vec::new();

        let mut ids: Vec<TagsetId> = tagsets.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let tags = &tagsets[&id];
            let key: Vec<Option<String>> = group_keys
                .iter()
                .map(|k| tags.get(k).map(|v| v.to_string()))
                .collect();

            let group = *index.entry(key).or_insert_with(|| {
                outputs.push(GroupOutput {
                    tags: tags
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                    aggregate_tags: Vec::new(),
                });
                all_keys.push(tags.keys().map(|k| k.to_string()).collect());
                outputs.len() - 1
            });
            group_of.insert(id, group);

            // Shrink the intersection, grow the key union
            let output = &mut outputs[group];
            output
                .tags
                .retain(|k, v| tags.get(k).map_or(false, |other| other == v));
            all_keys[group].extend(tags.keys().map(|k| k.to_string()));
        }

        for (group, output) in outputs.iter_mut().enumerate() {
            let mut folded: Vec<String> = all_keys[group]
                .iter()
                .filter(|k| !output.tags.contains_key(*k))
                .cloned()
                .collect();
            folded.sort();
            output.aggregate_tags = folded;
        }

        let mut order: Vec<(Vec<Option<String>>, usize)> = index.into_iter().collect();
        order.sort();

        Self {
            group_of,
            order,
            outputs,
        }
    }

    fn group_of(&self, id: TagsetId) -> Option<usize> {
        self.group_of.get(&id).copied()
    }

    /// Pair each group's metadata with its folded buckets, in key order
    fn into_groups(
        self,
        mut buckets: HashMap<usize, BTreeMap<DateTime<Utc>, Aggregator>>,
    ) -> Vec<(GroupOutput, BTreeMap<DateTime<Utc>, Aggregator>)> {
        let mut outputs: Vec<Option<GroupOutput>> = self.outputs.into_iter().map(Some).collect();
        let mut groups = Vec::new();
        for (_, group) in self.order {
            let Some(series_buckets) = buckets.remove(&group) else {
                continue;
            };
            if let Some(output) = outputs[group].take() {
                groups.push((output, series_buckets));
            }
        }
        groups
    }
}

// ============================================================================
// Row query construction
// ============================================================================

/// A fully parameterized row query
pub struct RowQuery {
    /// The SQL text (only fixed identifiers interpolated)
    pub sql: String,
    params: Vec<SqlValue>,
}

enum SqlValue {
    Metric(MetricId),
    Ids(Vec<TagsetId>),
    Time(DateTime<Utc>),
    Interval(String),
}

impl RowQuery {
    fn fetch<'a>(
        &'a self,
        pool: &'a PgPool,
    ) -> futures::stream::BoxStream<'a, std::result::Result<sqlx::postgres::PgRow, sqlx::Error>>
    {
        let mut query = sqlx::query(&self.sql);
        for param in &self.params {
            query = match param {
                SqlValue::Metric(id) => query.bind(*id),
                SqlValue::Ids(ids) => query.bind(ids),
                SqlValue::Time(t) => query.bind(*t),
                SqlValue::Interval(text) => query.bind(text),
            };
        }
        query.fetch(pool)
    }
}

/// Build the row query for a subquery
///
/// `order_by_series` selects `(tagset_id, bucket)` ordering (the per-series
/// path segments on tagset changes); the grouped path orders by bucket so
/// aggregators see time-ascending input within every bucket.
fn build_row_query(
    metric_id: MetricId,
    ids: Vec<TagsetId>,
    scan_start: DateTime<Utc>,
    range: QueryRange,
    downsample: Option<&Downsample>,
    order_by_series: bool,
) -> RowQuery {
    let mut params: Vec<SqlValue> = Vec::new();
    let mut next = {
        let mut n = 0;
        move |params: &mut Vec<SqlValue>, value: SqlValue| {
            params.push(value);
            n += 1;
            format!("${}", n)
        }
    };

    let order = if order_by_series { "2, 1" } else { "1, 2" };

    let sql = match downsample {
        None => {
            let metric = next(&mut params, SqlValue::Metric(metric_id));
            let ids = next(&mut params, SqlValue::Ids(ids));
            let start = next(&mut params, SqlValue::Time(scan_start));
            let end = next(&mut params, SqlValue::Time(range.end));
            format!(
                "SELECT time AS bucket, tagset_id, value FROM point \
                 WHERE metric_id = {metric} AND tagset_id = ANY({ids}) \
                 AND time >= {start} AND time <= {end} \
                 ORDER BY {order}"
            )
        }
        Some(ds) => match ds.interval_text() {
            None => {
                // The `all` sentinel: one bucket per series, stamped with the
                // query start
                let label = next(&mut params, SqlValue::Time(range.start));
                let metric = next(&mut params, SqlValue::Metric(metric_id));
                let ids = next(&mut params, SqlValue::Ids(ids));
                let start = next(&mut params, SqlValue::Time(scan_start));
                let end = next(&mut params, SqlValue::Time(range.end));
                let agg = ds.aggregate_expr();
                format!(
                    "SELECT {label}::timestamptz AS bucket, tagset_id, {agg} AS value \
                     FROM point \
                     WHERE metric_id = {metric} AND tagset_id = ANY({ids}) \
                     AND time >= {start} AND time <= {end} \
                     GROUP BY tagset_id ORDER BY tagset_id"
                )
            }
            Some(interval) => {
                let width = ds.bucket.unwrap_or_else(Duration::zero);
                let end = ceil_to_bucket(range.end, width);
                let agg = ds.aggregate_expr();
                if ds.gapfill() {
                    let w = next(&mut params, SqlValue::Interval(interval));
                    let metric = next(&mut params, SqlValue::Metric(metric_id));
                    let ids = next(&mut params, SqlValue::Ids(ids));
                    let start = next(&mut params, SqlValue::Time(scan_start));
                    let end = next(&mut params, SqlValue::Time(end));
                    format!(
                        "SELECT bucket + {w}::interval AS bucket, tagset_id, value FROM ( \
                         SELECT time_bucket_gapfill({w}::interval, time) AS bucket, \
                         tagset_id, {agg} AS value \
                         FROM point \
                         WHERE metric_id = {metric} AND tagset_id = ANY({ids}) \
                         AND time >= {start} AND time < {end} \
                         GROUP BY 1, 2 \
                         ) g ORDER BY {order}"
                    )
                } else {
                    let w = next(&mut params, SqlValue::Interval(interval));
                    let metric = next(&mut params, SqlValue::Metric(metric_id));
                    let ids = next(&mut params, SqlValue::Ids(ids));
                    let start = next(&mut params, SqlValue::Time(scan_start));
                    let end = next(&mut params, SqlValue::Time(end));
                    format!(
                        "SELECT time_bucket({w}::interval, time) + {w}::interval AS bucket, \
                         tagset_id, {agg} AS value \
                         FROM point \
                         WHERE metric_id = {metric} AND tagset_id = ANY({ids}) \
                         AND time >= {start} AND time < {end} \
                         GROUP BY 1, 2 ORDER BY {order}"
                    )
                }
            }
        },
    };

    RowQuery { sql, params }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn range(start_h: u32, end_h: u32) -> QueryRange {
        QueryRange {
            start: Utc.with_ymd_and_hms(2023, 6, 15, start_h, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2023, 6, 15, end_h, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_raw_query_shape() {
        let q = build_row_query(1, vec![1, 2], range(0, 1).start, range(0, 1), None, true);
        assert!(q.sql.contains("time AS bucket"));
        assert!(q.sql.contains("time >= $3 AND time <= $4"));
        assert!(q.sql.contains("ORDER BY 2, 1"));
        assert_eq!(q.params.len(), 4);
    }

    #[test]
    fn test_downsample_query_uses_time_bucket() {
        let ds: Downsample = "1h-sum".parse().unwrap();
        let q = build_row_query(1, vec![1], range(0, 3).start, range(0, 3), Some(&ds), false);
        assert!(q.sql.contains("time_bucket($1::interval, time) + $1::interval"));
        assert!(!q.sql.contains("gapfill"));
        assert!(q.sql.contains("sum(value)"));
        assert!(q.sql.contains("ORDER BY 1, 2"));
    }

    #[test]
    fn test_gapfill_query_shape() {
        let ds: Downsample = "1m-sum-zero".parse().unwrap();
        let q = build_row_query(1, vec![1], range(0, 1).start, range(0, 1), Some(&ds), true);
        assert!(q.sql.contains("time_bucket_gapfill($1::interval, time)"));
        assert!(q.sql.contains("time >= $4 AND time < $5"));
    }

    #[test]
    fn test_all_sentinel_uses_start_label() {
        let ds = Downsample::all(AggregatorKind::Avg);
        let q = build_row_query(1, vec![1], range(2, 4).start, range(2, 4), Some(&ds), false);
        assert!(q.sql.contains("$1::timestamptz AS bucket"));
        assert!(q.sql.contains("avg(value)"));
        assert!(q.sql.contains("GROUP BY tagset_id"));
    }

    #[test]
    fn test_group_lookup_intersection_and_aggregate_tags() {
        let mut tagsets = HashMap::new();
        tagsets.insert(
            1,
            Arc::new(Tagset::new(vec![
                ("host".to_string(), "a".to_string()),
                ("dc".to_string(), "ams".to_string()),
            ])),
        );
        tagsets.insert(
            2,
            Arc::new(Tagset::new(vec![
                ("host".to_string(), "b".to_string()),
                ("dc".to_string(), "ams".to_string()),
            ])),
        );
        // No group-by keys: everything lands in one group
        let lookup = TagsetGroupLookup::new(&tagsets, &[]);
        assert_eq!(lookup.group_of(1), lookup.group_of(2));

        let group = lookup.group_of(1).unwrap();
        let mut buckets = HashMap::new();
        buckets.insert(group, BTreeMap::new());
        let groups = lookup.into_groups(buckets);
        assert_eq!(groups.len(), 1);
        let output = &groups[0].0;
        // Intersection keeps dc=ams, host differs and is folded away
        assert_eq!(output.tags.get("dc").map(String::as_str), Some("ams"));
        assert!(!output.tags.contains_key("host"));
        assert_eq!(output.aggregate_tags, vec!["host".to_string()]);
    }

    #[test]
    fn test_group_lookup_split_by_group_key() {
        let mut tagsets = HashMap::new();
        tagsets.insert(
            1,
            Arc::new(Tagset::new(vec![("host".to_string(), "a".to_string())])),
        );
        tagsets.insert(
            2,
            Arc::new(Tagset::new(vec![("host".to_string(), "b".to_string())])),
        );
        let filters = vec![QueryFilter::new(
            "host",
            TagPredicate::from_tag_value("*").unwrap(),
            true,
        )];
        let lookup = TagsetGroupLookup::new(&tagsets, &filters);
        assert_ne!(lookup.group_of(1), lookup.group_of(2));
    }

    #[test]
    fn test_push_bucket_fill_policies() {
        let t = Utc.with_ymd_and_hms(2023, 6, 15, 0, 0, 0).unwrap();

        let mut dps = Vec::new();
        push_bucket(&mut dps, t, None, FillPolicy::Zero);
        assert_eq!(dps, vec![(t.timestamp(), Some(0.0))]);

        let mut dps = Vec::new();
        push_bucket(&mut dps, t, None, FillPolicy::Nan);
        assert!(dps[0].1.unwrap().is_nan());

        let mut dps = Vec::new();
        push_bucket(&mut dps, t, None, FillPolicy::Null);
        assert_eq!(dps, vec![(t.timestamp(), None)]);

        let mut dps = Vec::new();
        push_bucket(&mut dps, t, None, FillPolicy::None);
        assert!(dps.is_empty());
    }
}
