//! Concurrent tag index: tag key -> tag value -> set of tagset ids
//!
//! Readers (the query path) proceed concurrently with the single writer (the
//! tagset cache refresh). Individual `(key, value, id)` triples appear and
//! disappear atomically; a reader racing a refresh may observe it partially
//! applied but never a torn entry.
//!
//! A flat universe of all tag values is maintained alongside the nested maps
//! so value suggestion without a key argument stays O(1) per candidate.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};

use crate::types::{Tagset, TagsetId};

/// Set of tagset ids sharing one (key, value) pair
pub type TagValueIndex = DashMap<String, DashSet<TagsetId>>;

/// Nested concurrent index over tag pairs
#[derive(Default)]
pub struct TagIndex {
    /// tag key -> (tag value -> tagset ids)
    keys: DashMap<String, Arc<TagValueIndex>>,
    /// Union of tag values across all keys
    all_values: DashSet<String>,
}

impl TagIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that tagset `id` carries the pair `(key, value)`
    pub fn add_tag(&self, key: &str, value: &str, id: TagsetId) {
        let values = Arc::clone(
            self.keys
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(TagValueIndex::new()))
                .value(),
        );
        values
            .entry(value.to_string())
            .or_insert_with(DashSet::new)
            .insert(id);
        self.all_values.insert(value.to_string());
    }

    /// Remove every pair of `tags` for tagset `id`
    ///
    /// With `prune_values` set, value entries left empty are dropped and the
    /// flat value universe is kept consistent pair by pair; bulk callers pass
    /// `false` and finish with one [`TagIndex::rebuild_tag_values`] instead.
    pub fn remove_tagset(&self, id: TagsetId, tags: &Tagset, prune_values: bool) {
        for (key, value) in tags.iter() {
            let Some(values) = self.keys.get(key).map(|v| Arc::clone(v.value())) else {
                continue;
            };
            let now_empty = match values.get(value) {
                Some(ids) => {
                    ids.remove(&id);
                    ids.is_empty()
                }
                None => continue,
            };
            if prune_values && now_empty {
                // Re-check under the removal so a concurrent add_tag of the
                // same value is not clobbered silently; the single-writer
                // discipline makes this a formality.
                values.remove_if(value, |_, ids| ids.is_empty());
                if !self.value_in_use(value) {
                    self.all_values.remove(value);
                }
            }
        }
    }

    /// Rebuild the flat value universe from the nested maps
    ///
    /// O(total pairs); used after bulk removals that passed
    /// `prune_values = false`.
    pub fn rebuild_tag_values(&self) {
        self.all_values.clear();
        for entry in self.keys.iter() {
            // Drop value entries whose id set was emptied by the bulk removal
            entry.value().retain(|_, ids| !ids.is_empty());
            for value in entry.value().iter() {
                self.all_values.insert(value.key().clone());
            }
        }
        self.keys.retain(|_, values| !values.is_empty());
    }

    /// The value index for a tag key, if the key is known
    pub fn value_index(&self, key: &str) -> Option<Arc<TagValueIndex>> {
        self.keys.get(key).map(|v| Arc::clone(v.value()))
    }

    /// Number of distinct values recorded under a key (selectivity heuristic)
    pub fn possible_value_count(&self, key: &str) -> usize {
        self.keys.get(key).map(|v| v.len()).unwrap_or(0)
    }

    /// Snapshot of all known tag keys
    pub fn tag_keys(&self) -> Vec<String> {
        self.keys.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of the flat tag value universe
    pub fn tag_values(&self) -> Vec<String> {
        self.all_values.iter().map(|v| v.clone()).collect()
    }

    /// Snapshot of the values recorded under one key
    pub fn tag_values_for_key(&self, key: &str) -> Vec<String> {
        match self.keys.get(key) {
            Some(values) => values.iter().map(|e| e.key().clone()).collect(),
            None => Vec::new(),
        }
    }

    fn value_in_use(&self, value: &str) -> bool {
        self.keys.iter().any(|entry| {
            entry
                .value()
                .get(value)
                .map_or(false, |ids| !ids.is_empty())
        })
    }
}
