//! Tagset cache: the in-memory picture of every known time series
//!
//! The cache has two halves:
//!
//! - [`TagsetStore`] is the pure in-memory state (tagset lookup, per-metric
//!   membership, tag index) and the filter resolution algorithm behind
//!   `get_tagsets`. It has no database dependency and is what the query path
//!   reads lock-free.
//! - [`TagsetCache`] wraps the store with the database pool, the incremental
//!   refresh driven by two high-water marks over `created` timestamps, and
//!   the prune reconciliation against the authoritative tagset id set. One
//!   async mutex serializes refresh and prune; readers never block.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::TryStreamExt;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::cache::tag_index::TagIndex;
use crate::error::Result;
use crate::filter::QueryFilter;
use crate::types::{Tagset, TagsetId};

// ============================================================================
// In-memory store
// ============================================================================

/// The in-memory tagset state read by the query path
///
/// Invariant: every tagset id appearing in the tag index or in a per-metric
/// membership list is also a key of the tagset lookup. Inserts establish the
/// lookup entry first and prune removes it last.
#[derive(Default)]
pub struct TagsetStore {
    /// tagset id -> canonical tags
    tagsets_by_id: DashMap<TagsetId, Arc<Tagset>>,
    /// metric name -> tagset ids with a `time_series` row
    tagset_ids_by_metric: DashMap<String, Vec<TagsetId>>,
    /// Nested tag pair index
    tag_index: TagIndex,
}

impl TagsetStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tagset; idempotent for already-known ids
    pub fn insert_tagset(&self, id: TagsetId, tags: Tagset) {
        if self.tagsets_by_id.contains_key(&id) {
            return;
        }
        let tags = Arc::new(tags);
        // Lookup entry goes first so the index never references an unknown id
        self.tagsets_by_id.insert(id, tags.clone());
        for (key, value) in tags.iter() {
            self.tag_index.add_tag(key, value, id);
        }
    }

    /// Record that `metric` has a series over tagset `id`
    pub fn add_series(&self, metric: &str, id: TagsetId) {
        let mut ids = self
            .tagset_ids_by_metric
            .entry(metric.to_string())
            .or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    /// Look up a tagset by id
    pub fn tagset(&self, id: TagsetId) -> Option<Arc<Tagset>> {
        self.tagsets_by_id.get(&id).map(|t| Arc::clone(t.value()))
    }

    /// Number of cached tagsets
    pub fn len(&self) -> usize {
        self.tagsets_by_id.len()
    }

    /// Whether the store holds no tagsets
    pub fn is_empty(&self) -> bool {
        self.tagsets_by_id.is_empty()
    }

    /// The tag index
    pub fn tag_index(&self) -> &TagIndex {
        &self.tag_index
    }

    /// Resolve the tagsets matching a set of filters
    ///
    /// `metrics` restricts candidates to series of those metrics; an empty
    /// slice means all metrics (used by lookup with `metric: "*"`). Filters
    /// are applied in ascending selectivity order, each via the cheaper of a
    /// forward index scan or a backward candidate scan. An unknown filter key
    /// yields an empty result rather than an error.
    pub fn get_tagsets(
        &self,
        metrics: &[String],
        filters: &[QueryFilter],
        explicit_tags: bool,
    ) -> HashMap<TagsetId, Arc<Tagset>> {
        if filters.is_empty() && metrics.is_empty() {
            return self
                .tagsets_by_id
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect();
        }

        let mut candidates: HashSet<TagsetId> = if metrics.is_empty() {
            self.tagsets_by_id.iter().map(|e| *e.key()).collect()
        } else {
            let mut union = HashSet::new();
            for metric in metrics {
                if let Some(ids) = self.tagset_ids_by_metric.get(metric) {
                    union.extend(ids.iter().copied());
                }
            }
            union
        };
        if candidates.is_empty() {
            return HashMap::new();
        }

        if explicit_tags {
            let filter_keys: HashSet<&str> = filters.iter().map(|f| f.key.as_str()).collect();
            candidates.retain(|id| {
                self.tagsets_by_id.get(id).map_or(false, |tags| {
                    tags.len() == filter_keys.len()
                        && tags.keys().all(|k| filter_keys.contains(k))
                })
            });
            if candidates.is_empty() {
                return HashMap::new();
            }
        }

        let mut ordered: Vec<&QueryFilter> = filters.iter().collect();
        ordered.sort_by_key(|f| self.tag_index.possible_value_count(&f.key));

        for filter in ordered {
            let Some(value_index) = self.tag_index.value_index(&filter.key) else {
                return HashMap::new();
            };
            if value_index.is_empty() {
                return HashMap::new();
            }

            let backward =
                !filter.predicate.is_literal_or() && value_index.len() > candidates.len();
            if backward {
                candidates.retain(|id| {
                    self.tagsets_by_id.get(id).map_or(false, |tags| {
                        tags.get(&filter.key)
                            .map_or(false, |v| filter.predicate.matches(v))
                    })
                });
            } else {
                let mut matching: HashSet<TagsetId> = HashSet::new();
                for entry in value_index.iter() {
                    if filter.predicate.matches(entry.key()) {
                        matching.extend(entry.value().iter().map(|id| *id));
                    }
                }
                // Intersect in place, shrinking the smaller set
                if matching.len() < candidates.len() {
                    matching.retain(|id| candidates.contains(id));
                    candidates = matching;
                } else {
                    candidates.retain(|id| matching.contains(id));
                }
            }
            if candidates.is_empty() {
                return HashMap::new();
            }
        }

        candidates
            .into_iter()
            .filter_map(|id| {
                self.tagsets_by_id
                    .get(&id)
                    .map(|t| (id, Arc::clone(t.value())))
            })
            .collect()
    }

    /// Drop every tagset not in `live`, reconciling all three maps
    ///
    /// Returns the number of tagsets removed.
    pub fn prune_to(&self, live: &HashSet<TagsetId>) -> usize {
        let dead: Vec<(TagsetId, Arc<Tagset>)> = self
            .tagsets_by_id
            .iter()
            .filter(|e| !live.contains(e.key()))
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        if dead.is_empty() {
            return 0;
        }

        let dead_ids: HashSet<TagsetId> = dead.iter().map(|(id, _)| *id).collect();
        for (id, tags) in &dead {
            self.tag_index.remove_tagset(*id, tags, false);
            self.tagsets_by_id.remove(id);
        }
        self.tag_index.rebuild_tag_values();

        for mut entry in self.tagset_ids_by_metric.iter_mut() {
            entry.value_mut().retain(|id| !dead_ids.contains(id));
        }
        self.tagset_ids_by_metric.retain(|_, ids| !ids.is_empty());

        dead.len()
    }

    // ------------------------------------------------------------------
    // Suggest support
    // ------------------------------------------------------------------

    /// Known metric names with a given prefix, sorted, at most `max`
    pub fn metric_names(&self, prefix: &str, max: usize) -> Vec<String> {
        let mut names: Vec<String> = self
            .tagset_ids_by_metric
            .iter()
            .map(|e| e.key().clone())
            .filter(|name| name.starts_with(prefix))
            .collect();
        names.sort();
        names.truncate(max);
        names
    }

    /// Known tag keys with a given prefix, sorted, at most `max`
    pub fn tag_keys(&self, prefix: &str, max: usize) -> Vec<String> {
        let mut keys: Vec<String> = self
            .tag_index
            .tag_keys()
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect();
        keys.sort();
        keys.truncate(max);
        keys
    }

    /// Known tag values (across all keys) with a given prefix, sorted
    pub fn tag_values(&self, prefix: &str, max: usize) -> Vec<String> {
        let mut values: Vec<String> = self
            .tag_index
            .tag_values()
            .into_iter()
            .filter(|value| value.starts_with(prefix))
            .collect();
        values.sort();
        values.truncate(max);
        values
    }

    /// Tag keys appearing on any series of one metric, sorted
    pub fn tag_keys_for_metric(&self, metric: &str) -> Vec<String> {
        let mut keys: HashSet<String> = HashSet::new();
        if let Some(ids) = self.tagset_ids_by_metric.get(metric) {
            for id in ids.iter() {
                if let Some(tags) = self.tagsets_by_id.get(id) {
                    keys.extend(tags.keys().map(|k| k.to_string()));
                }
            }
        }
        let mut keys: Vec<String> = keys.into_iter().collect();
        keys.sort();
        keys
    }

    /// Values recorded under one tag key, sorted
    pub fn tag_values_for_key(&self, key: &str) -> Vec<String> {
        let mut values = self.tag_index.tag_values_for_key(key);
        values.sort();
        values
    }
}

// ============================================================================
// Cache service
// ============================================================================

/// Counters from one refresh cycle
#[derive(Debug, Default, Clone, Copy)]
pub struct RefreshStats {
    /// Tagset rows ingested this cycle
    pub new_tagsets: usize,
    /// Time-series rows ingested this cycle
    pub new_series: usize,
}

/// The database-backed tagset cache service
pub struct TagsetCache {
    pool: PgPool,
    store: TagsetStore,
    tagset_hwm: parking_lot::RwLock<Option<DateTime<Utc>>>,
    series_hwm: parking_lot::RwLock<Option<DateTime<Utc>>>,
    last_refresh: parking_lot::RwLock<Option<Instant>>,
    /// Serializes refresh and prune; held across awaits
    update_lock: tokio::sync::Mutex<()>,
}

impl TagsetCache {
    /// Create a cache over a connection pool; empty until the first refresh
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            store: TagsetStore::new(),
            tagset_hwm: parking_lot::RwLock::new(None),
            series_hwm: parking_lot::RwLock::new(None),
            last_refresh: parking_lot::RwLock::new(None),
            update_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The in-memory store (the query path's read surface)
    pub fn store(&self) -> &TagsetStore {
        &self.store
    }

    /// Incrementally pull tagset and time-series rows created since the last
    /// refresh
    ///
    /// The high-water marks advance per row, so a cancellation mid-stream
    /// leaves the next refresh resuming exactly where this one stopped.
    pub async fn refresh(&self) -> Result<RefreshStats> {
        let _guard = self.update_lock.lock().await;
        let mut stats = RefreshStats::default();

        let since = (*self.tagset_hwm.read()).unwrap_or(DateTime::UNIX_EPOCH);
        {
            let mut rows = sqlx::query(
                "SELECT id, tags, created FROM tagset WHERE created > $1 ORDER BY created",
            )
            .bind(since)
            .fetch(&self.pool);

            while let Some(row) = rows.try_next().await? {
                let id: TagsetId = row.try_get("id")?;
                let tags: serde_json::Value = row.try_get("tags")?;
                let created: DateTime<Utc> = row.try_get("created")?;

                match Tagset::from_json(&tags) {
                    Some(tagset) => {
                        self.store.insert_tagset(id, tagset);
                        stats.new_tagsets += 1;
                    }
                    None => {
                        tracing::warn!(tagset_id = id, "Skipping tagset row with malformed tags")
                    }
                }
                *self.tagset_hwm.write() = Some(created);
            }
        }

        let since = (*self.series_hwm.read()).unwrap_or(DateTime::UNIX_EPOCH);
        {
            let mut rows = sqlx::query(
                "SELECT m.name, ts.tagset_id, ts.created \
                 FROM time_series ts \
                 JOIN metric m ON m.id = ts.metric_id \
                 WHERE ts.created > $1 \
                 ORDER BY ts.created",
            )
            .bind(since)
            .fetch(&self.pool);

            while let Some(row) = rows.try_next().await? {
                let metric: String = row.try_get("name")?;
                let tagset_id: TagsetId = row.try_get("tagset_id")?;
                let created: DateTime<Utc> = row.try_get("created")?;

                self.store.add_series(&metric, tagset_id);
                stats.new_series += 1;
                *self.series_hwm.write() = Some(created);
            }
        }

        *self.last_refresh.write() = Some(Instant::now());
        tracing::debug!(
            new_tagsets = stats.new_tagsets,
            new_series = stats.new_series,
            cached_tagsets = self.store.len(),
            "Tagset cache refreshed"
        );
        Ok(stats)
    }

    /// Reconcile the in-memory state against the authoritative tagset id set
    ///
    /// No-op until at least one refresh succeeded. Returns the number of
    /// tagsets dropped.
    pub async fn prune(&self) -> Result<usize> {
        let _guard = self.update_lock.lock().await;
        if self.last_refresh.read().is_none() {
            return Ok(0);
        }

        let live: Vec<TagsetId> = sqlx::query_scalar("SELECT id FROM tagset")
            .fetch_all(&self.pool)
            .await?;
        let live: HashSet<TagsetId> = live.into_iter().collect();

        let removed = self.store.prune_to(&live);
        if removed > 0 {
            tracing::info!(removed, "Pruned stale tagsets from cache");
        }
        Ok(removed)
    }

    /// Whether the last successful refresh is younger than `max_age`
    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.last_refresh
            .read()
            .map_or(false, |at| at.elapsed() <= max_age)
    }
}
