//! Ingest pipeline: id resolution, bulk insert, cache revalidation
//!
//! Writes resolve metric and tagset names to their database ids through two
//! bounded TTL-LRU caches, upsert whatever is missing, and land the points in
//! one ordered bulk insert. Both upserts sort their keys ascending and the
//! point insert is ordered `(metric_id, tagset_id, time)` inside the SQL, so
//! concurrent batches touching the same rows lock in the same order and
//! cannot deadlock.
//!
//! Failure is all-or-nothing: any database error aborts the batch and leaves
//! the caches untouched; the caller retries.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::cache::TtlLru;
use crate::error::IngestError;
use crate::types::{DataPoint, MetricId, Tagset, TagsetId};

/// Statistics returned for one write batch
#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteStats {
    /// Rows actually inserted (conflicting duplicates are not counted)
    pub points_written: u64,
    /// Wall time of the batch in milliseconds
    pub write_time_ms: u64,
    /// Throughput in thousands of points per second
    pub kdps: f64,
    /// Fraction of points whose metric id missed the cache
    pub metric_miss_rate: f64,
    /// Fraction of points whose tagset id missed the cache
    pub tagset_miss_rate: f64,
}

/// The ingest pipeline
pub struct Ingestor {
    pool: PgPool,
    metric_ids: TtlLru<String, MetricId>,
    /// Keyed by the tagset's canonical JSON
    tagset_ids: TtlLru<String, TagsetId>,
}

impl Ingestor {
    /// Create an ingestor; the cache TTL must stay below half the retention
    /// window so a cached id cannot outlive its row
    pub fn new(
        pool: PgPool,
        metric_cache_size: usize,
        tagset_cache_size: usize,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            pool,
            metric_ids: TtlLru::new(metric_cache_size, cache_ttl),
            tagset_ids: TtlLru::new(tagset_cache_size, cache_ttl),
        }
    }

    /// Write one batch of points
    pub async fn write(&self, points: &[DataPoint]) -> Result<WriteStats, IngestError> {
        let started = std::time::Instant::now();
        validate(points)?;

        let mut oldest: Option<DateTime<Utc>> = None;
        let mut metric_ids: HashMap<String, Option<MetricId>> = HashMap::new();
        let mut tagset_ids: HashMap<String, Option<TagsetId>> = HashMap::new();
        let mut point_keys: Vec<String> = Vec::with_capacity(points.len());
        let mut metric_misses = 0usize;
        let mut tagset_misses = 0usize;

        for point in points {
            oldest = Some(oldest.map_or(point.time, |t: DateTime<Utc>| t.min(point.time)));

            let resolved = metric_ids
                .entry(point.metric.clone())
                .or_insert_with(|| self.metric_ids.try_get(&point.metric));
            if resolved.is_none() {
                metric_misses += 1;
            }

            let key = point.tags.canonical_json();
            let resolved = tagset_ids
                .entry(key.clone())
                .or_insert_with(|| self.tagset_ids.try_get(&key));
            if resolved.is_none() {
                tagset_misses += 1;
            }
            point_keys.push(key);
        }

        self.resolve_missing_metrics(&mut metric_ids).await?;
        self.resolve_missing_tagsets(&mut tagset_ids).await?;

        // Parallel arrays for the ordered bulk insert
        let mut m_ids = Vec::with_capacity(points.len());
        let mut t_ids = Vec::with_capacity(points.len());
        let mut times = Vec::with_capacity(points.len());
        let mut values = Vec::with_capacity(points.len());
        for (point, key) in points.iter().zip(&point_keys) {
            let metric_id = metric_ids[&point.metric].ok_or_else(|| {
                IngestError::Validation(format!("metric '{}' failed to resolve", point.metric))
            })?;
            let tagset_id = tagset_ids[key].ok_or_else(|| {
                IngestError::Validation(format!("tagset '{}' failed to resolve", key))
            })?;
            m_ids.push(metric_id);
            t_ids.push(tagset_id);
            times.push(point.time);
            values.push(point.value);
        }

        let result = sqlx::query(
            "INSERT INTO point (metric_id, tagset_id, time, value) \
             SELECT * FROM unnest($1::smallint[], $2::int[], $3::timestamptz[], $4::float8[]) \
             ORDER BY 1, 2, 3 \
             ON CONFLICT DO NOTHING",
        )
        .bind(&m_ids)
        .bind(&t_ids)
        .bind(&times)
        .bind(&values)
        .execute(&self.pool)
        .await?;

        // The batch is durable; revalidate every id it used
        let as_of = oldest.unwrap_or_else(Utc::now);
        for (name, id) in &metric_ids {
            if let Some(id) = id {
                self.metric_ids.add_or_revalidate(name.clone(), *id, as_of);
            }
        }
        for (key, id) in &tagset_ids {
            if let Some(id) = id {
                self.tagset_ids.add_or_revalidate(key.clone(), *id, as_of);
            }
        }

        let elapsed = started.elapsed();
        let stats = WriteStats {
            points_written: result.rows_affected(),
            write_time_ms: elapsed.as_millis() as u64,
            kdps: points.len() as f64 / elapsed.as_secs_f64().max(1e-9) / 1000.0,
            metric_miss_rate: metric_misses as f64 / points.len() as f64,
            tagset_miss_rate: tagset_misses as f64 / points.len() as f64,
        };
        tracing::debug!(
            points = points.len(),
            written = stats.points_written,
            write_time_ms = stats.write_time_ms,
            "Batch written"
        );
        Ok(stats)
    }

    /// Upsert unresolved metric names, sorted ascending for deadlock safety
    ///
    /// The spurious `DO UPDATE` forces `RETURNING` to include rows that
    /// already existed.
    async fn resolve_missing_metrics(
        &self,
        metric_ids: &mut HashMap<String, Option<MetricId>>,
    ) -> Result<(), IngestError> {
        let mut missing: Vec<String> = metric_ids
            .iter()
            .filter(|(_, id)| id.is_none())
            .map(|(name, _)| name.clone())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort();

        let rows = sqlx::query(
            "INSERT INTO metric (name) \
             SELECT name FROM unnest($1::text[]) AS missing(name) \
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name \
             RETURNING id, name",
        )
        .bind(&missing)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let id: MetricId = row.try_get("id")?;
            let name: String = row.try_get("name")?;
            if let Some(slot) = metric_ids.get_mut(&name) {
                *slot = Some(id);
            }
        }
        Ok(())
    }

    /// Upsert unresolved tagsets, sorted by canonical JSON for deadlock
    /// safety
    async fn resolve_missing_tagsets(
        &self,
        tagset_ids: &mut HashMap<String, Option<TagsetId>>,
    ) -> Result<(), IngestError> {
        let mut missing: Vec<String> = tagset_ids
            .iter()
            .filter(|(_, id)| id.is_none())
            .map(|(key, _)| key.clone())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort();

        let payload: Vec<serde_json::Value> = missing
            .iter()
            .map(|key| {
                serde_json::from_str(key).map_err(|e| {
                    IngestError::Validation(format!("unencodable tagset '{}': {}", key, e))
                })
            })
            .collect::<Result<_, _>>()?;

        let rows = sqlx::query(
            "INSERT INTO tagset (tags) \
             SELECT tags FROM unnest($1::jsonb[]) AS missing(tags) \
             ON CONFLICT (tags) DO UPDATE SET tags = EXCLUDED.tags \
             RETURNING id, tags",
        )
        .bind(&payload)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let id: TagsetId = row.try_get("id")?;
            let tags: serde_json::Value = row.try_get("tags")?;
            let Some(tagset) = Tagset::from_json(&tags) else {
                continue;
            };
            if let Some(slot) = tagset_ids.get_mut(&tagset.canonical_json()) {
                *slot = Some(id);
            }
        }
        Ok(())
    }
}

fn validate(points: &[DataPoint]) -> Result<(), IngestError> {
    if points.is_empty() {
        return Err(IngestError::Validation("empty batch".to_string()));
    }
    for point in points {
        if point.metric.is_empty() {
            return Err(IngestError::Validation("empty metric name".to_string()));
        }
        for (key, value) in point.tags.iter() {
            if key.is_empty() || value.is_empty() {
                return Err(IngestError::Validation(format!(
                    "point for '{}' has an empty tag key or value",
                    point.metric
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn point(metric: &str, tags: &[(&str, &str)]) -> DataPoint {
        DataPoint {
            metric: metric.to_string(),
            time: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
            value: 1.0,
            tags: Tagset::new(tags.iter().map(|(k, v)| (k.to_string(), v.to_string()))),
        }
    }

    #[test]
    fn test_validate_rejects_empty_batch() {
        assert!(validate(&[]).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_metric() {
        assert!(validate(&[point("", &[("host", "a")])]).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_tag_parts() {
        assert!(validate(&[point("cpu", &[("host", "")])]).is_err());
        assert!(validate(&[point("cpu", &[("", "a")])]).is_err());
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        assert!(validate(&[point("cpu", &[("host", "a")])]).is_ok());
        // A tagless point is well-formed; only empty keys or values are not
        assert!(validate(&[point("cpu", &[])]).is_ok());
    }
}
