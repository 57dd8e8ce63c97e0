//! Filter resolution against the in-memory tagset store

use std::collections::HashSet;

use tsgate::cache::TagsetStore;
use tsgate::filter::{QueryFilter, TagPredicate};
use tsgate::types::{Tagset, TagsetId};

fn tagset(pairs: &[(&str, &str)]) -> Tagset {
    Tagset::new(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
}

fn filter(key: &str, kind: &str, expr: &str) -> QueryFilter {
    QueryFilter::new(key, TagPredicate::parse(kind, expr).unwrap(), false)
}

/// cpu: web1/ams (1), web2/ams (2), web1/fra+rack (3); mem: web1/ams (4)
fn fixture() -> TagsetStore {
    let store = TagsetStore::new();
    store.insert_tagset(1, tagset(&[("host", "web1"), ("dc", "ams")]));
    store.insert_tagset(2, tagset(&[("host", "web2"), ("dc", "ams")]));
    store.insert_tagset(3, tagset(&[("host", "web1"), ("dc", "fra"), ("rack", "r1")]));
    store.insert_tagset(4, tagset(&[("host", "web1"), ("dc", "ams")]));
    for id in [1, 2, 3] {
        store.add_series("cpu", id);
    }
    store.add_series("mem", 4);
    store
}

fn ids(result: &std::collections::HashMap<TagsetId, std::sync::Arc<Tagset>>) -> HashSet<TagsetId> {
    result.keys().copied().collect()
}

#[test]
fn no_filters_and_no_metric_returns_everything() {
    let store = fixture();
    let result = store.get_tagsets(&[], &[], false);
    assert_eq!(ids(&result), HashSet::from([1, 2, 3, 4]));
}

#[test]
fn metric_restricts_candidates() {
    let store = fixture();
    let result = store.get_tagsets(&["cpu".to_string()], &[], false);
    assert_eq!(ids(&result), HashSet::from([1, 2, 3]));

    let result = store.get_tagsets(&["mem".to_string()], &[], false);
    assert_eq!(ids(&result), HashSet::from([4]));

    let result = store.get_tagsets(&["disk".to_string()], &[], false);
    assert!(result.is_empty());
}

#[test]
fn literal_or_filter() {
    let store = fixture();
    let filters = vec![filter("host", "literal_or", "web1")];
    let result = store.get_tagsets(&["cpu".to_string()], &filters, false);
    assert_eq!(ids(&result), HashSet::from([1, 3]));
}

#[test]
fn wildcard_filter_spans_values() {
    let store = fixture();
    let filters = vec![filter("host", "iwildcard", "WEB*")];
    let result = store.get_tagsets(&["cpu".to_string()], &filters, false);
    assert_eq!(ids(&result), HashSet::from([1, 2, 3]));
}

#[test]
fn not_literal_or_excludes() {
    let store = fixture();
    let filters = vec![filter("dc", "not_literal_or", "ams")];
    let result = store.get_tagsets(&["cpu".to_string()], &filters, false);
    assert_eq!(ids(&result), HashSet::from([3]));
}

#[test]
fn unknown_filter_key_yields_empty_not_error() {
    let store = fixture();
    let filters = vec![filter("pod", "literal_or", "x")];
    let result = store.get_tagsets(&["cpu".to_string()], &filters, false);
    assert!(result.is_empty());
}

#[test]
fn candidates_lacking_the_key_are_dropped() {
    let store = fixture();
    // Only tagset 3 carries "rack"; a permissive filter on it must still
    // exclude 1 and 2
    let filters = vec![filter("rack", "iwildcard", "*")];
    let result = store.get_tagsets(&["cpu".to_string()], &filters, false);
    assert_eq!(ids(&result), HashSet::from([3]));
}

#[test]
fn multiple_filters_intersect() {
    let store = fixture();
    let filters = vec![
        filter("host", "literal_or", "web1"),
        filter("dc", "literal_or", "ams"),
    ];
    let result = store.get_tagsets(&["cpu".to_string()], &filters, false);
    assert_eq!(ids(&result), HashSet::from([1]));
}

#[test]
fn filter_order_does_not_change_the_result() {
    let store = fixture();
    let a = vec![
        filter("host", "literal_or", "web1"),
        filter("dc", "literal_or", "fra"),
    ];
    let b = vec![
        filter("dc", "literal_or", "fra"),
        filter("host", "literal_or", "web1"),
    ];
    assert_eq!(
        ids(&store.get_tagsets(&["cpu".to_string()], &a, false)),
        ids(&store.get_tagsets(&["cpu".to_string()], &b, false))
    );
}

#[test]
fn get_tagsets_is_idempotent_on_an_unchanged_store() {
    let store = fixture();
    let filters = vec![filter("dc", "literal_or", "ams")];
    let first = store.get_tagsets(&["cpu".to_string()], &filters, false);
    let second = store.get_tagsets(&["cpu".to_string()], &filters, false);
    assert_eq!(ids(&first), ids(&second));
    for (id, tags) in &first {
        assert_eq!(second[id], *tags);
    }
}

#[test]
fn explicit_tags_requires_exact_key_set() {
    let store = fixture();
    let filters = vec![
        filter("host", "iwildcard", "*"),
        filter("dc", "iwildcard", "*"),
    ];
    // Tagset 3 has an extra "rack" key, so explicit_tags excludes it
    let result = store.get_tagsets(&["cpu".to_string()], &filters, true);
    assert_eq!(ids(&result), HashSet::from([1, 2]));

    let loose = store.get_tagsets(&["cpu".to_string()], &filters, false);
    assert_eq!(ids(&loose), HashSet::from([1, 2, 3]));
}

#[test]
fn explicit_tags_with_all_three_keys_matches_only_the_wide_tagset() {
    let store = fixture();
    let filters = vec![
        filter("host", "iwildcard", "*"),
        filter("dc", "iwildcard", "*"),
        filter("rack", "iwildcard", "*"),
    ];
    let result = store.get_tagsets(&["cpu".to_string()], &filters, true);
    assert_eq!(ids(&result), HashSet::from([3]));
}

#[test]
fn union_across_metrics() {
    let store = fixture();
    let metrics = ["cpu".to_string(), "mem".to_string()];
    let filters = vec![filter("host", "literal_or", "web1")];
    let result = store.get_tagsets(&metrics, &filters, false);
    assert_eq!(ids(&result), HashSet::from([1, 3, 4]));
}

#[test]
fn prune_reconciles_every_map() {
    let store = fixture();
    // Tagsets 2 and 3 disappeared from the database
    let live = HashSet::from([1, 4]);
    let removed = store.prune_to(&live);
    assert_eq!(removed, 2);

    assert!(store.tagset(2).is_none());
    assert!(store.tagset(3).is_none());
    assert!(store.tagset(1).is_some());

    // Membership no longer references the pruned ids
    let result = store.get_tagsets(&["cpu".to_string()], &[], false);
    assert_eq!(ids(&result), HashSet::from([1]));

    // The value universe dropped values only the pruned tagsets carried
    assert!(!store.tag_values("", 100).contains(&"fra".to_string()));
    assert!(!store.tag_keys("", 100).contains(&"rack".to_string()));
    assert!(store.tag_values("", 100).contains(&"ams".to_string()));
}

#[test]
fn prune_with_all_live_is_a_no_op() {
    let store = fixture();
    let live = HashSet::from([1, 2, 3, 4]);
    assert_eq!(store.prune_to(&live), 0);
    assert_eq!(store.len(), 4);
}

#[test]
fn add_series_deduplicates() {
    let store = TagsetStore::new();
    store.insert_tagset(1, tagset(&[("host", "a")]));
    store.add_series("cpu", 1);
    store.add_series("cpu", 1);
    let result = store.get_tagsets(&["cpu".to_string()], &[], false);
    assert_eq!(result.len(), 1);
}

#[test]
fn suggest_surfaces() {
    let store = fixture();
    assert_eq!(store.metric_names("", 25), vec!["cpu", "mem"]);
    assert_eq!(store.metric_names("c", 25), vec!["cpu"]);
    assert_eq!(store.metric_names("", 1), vec!["cpu"]);

    assert_eq!(store.tag_keys("", 25), vec!["dc", "host", "rack"]);
    assert_eq!(store.tag_keys_for_metric("mem"), vec!["dc", "host"]);
    assert_eq!(store.tag_values_for_key("dc"), vec!["ams", "fra"]);
    assert!(store
        .tag_values("web", 25)
        .iter()
        .all(|v| v.starts_with("web")));
}
