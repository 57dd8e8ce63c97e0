//! Stateful per-series rate conversion
//!
//! Rates are first differences divided by elapsed seconds. The query window
//! is widened by one hour upstream so the first in-range point has a
//! predecessor; emission is gated on `t >= query_start` to keep the widened
//! points out of the result. Counter mode treats a value drop as rollover
//! against a configurable maximum.

use chrono::{DateTime, Utc};

/// Options of the OpenTSDB `rateOptions` object
#[derive(Debug, Clone, Copy)]
pub struct RateOptions {
    /// Treat the series as a monotonic counter with rollover
    pub counter: bool,
    /// Maximum counter value before rollover
    pub counter_max: f64,
    /// Suppress the data point at a detected rollover instead of emitting
    /// the wrapped rate
    pub drop_resets: bool,
}

impl Default for RateOptions {
    fn default() -> Self {
        Self {
            counter: false,
            counter_max: i64::MAX as f64,
            drop_resets: false,
        }
    }
}

/// Per-series rate state; must be reset at every series boundary
#[derive(Debug)]
pub struct RateConverter {
    options: RateOptions,
    query_start: DateTime<Utc>,
    prev: Option<(DateTime<Utc>, f64)>,
}

impl RateConverter {
    /// Create a converter for one query
    pub fn new(options: RateOptions, query_start: DateTime<Utc>) -> Self {
        Self {
            options,
            query_start,
            prev: None,
        }
    }

    /// Forget the previous point; call when crossing into a new series
    pub fn reset(&mut self) {
        self.prev = None;
    }

    /// Feed the next point of the current series
    ///
    /// Returns the rate to emit for this point, or `None` when the point
    /// must be suppressed (no predecessor, before the query start, zero or
    /// negative elapsed time, or a dropped counter reset).
    pub fn try_calc(&mut self, t: DateTime<Utc>, v: f64) -> Option<f64> {
        let prev = self.prev.replace((t, v));
        let (t_prev, v_prev) = prev?;

        if t < self.query_start {
            return None;
        }
        let elapsed = (t - t_prev).num_microseconds()? as f64 / 1_000_000.0;
        if elapsed <= 0.0 {
            return None;
        }

        if self.options.counter && v < v_prev {
            if self.options.drop_resets {
                return None;
            }
            return Some((self.options.counter_max - v_prev + v) / elapsed);
        }
        Some((v - v_prev) / elapsed)
    }
}
