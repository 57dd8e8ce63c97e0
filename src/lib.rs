//! tsgate - OpenTSDB-compatible query gateway for TimescaleDB
//!
//! This library implements the core engine behind an HTTP adapter that speaks
//! the OpenTSDB JSON API while storing data points in a TimescaleDB
//! hypertable:
//! - In-memory tagset cache answering filter and suggest queries without
//!   touching the database on the read path
//! - Cached metric/tagset id resolution and batched, deadlock-safe ingest
//! - Time-bucket downsampling with gap-fill, streaming aggregation, and
//!   counter-aware rate conversion
//! - Retention-bound housekeeping of orphaned metrics, tagsets, and series

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod filter;
pub mod ingest;
pub mod query;
pub mod services;
pub mod types;

// Re-export main types
pub use config::Config;
pub use error::{Error, Result};
pub use types::{DataPoint, MetricId, Tagset, TagsetId};
