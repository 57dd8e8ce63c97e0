//! In-memory caches backing the ingest and query paths
//!
//! - [`ttl_lru`]: bounded TTL-LRU maps used by ingest for metric and tagset
//!   id resolution
//! - [`tag_index`]: the concurrent tag key -> value -> tagset-id index
//! - [`tagset`]: the unbounded tagset cache service with incremental refresh
//!   and pruning

pub mod tag_index;
pub mod tagset;
pub mod ttl_lru;

pub use tag_index::TagIndex;
pub use tagset::{TagsetCache, TagsetStore};
pub use ttl_lru::TtlLru;
