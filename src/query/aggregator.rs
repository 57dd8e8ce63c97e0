//! Streaming aggregation folds
//!
//! Aggregators combine the values of many series inside one time bucket.
//! Every fold ignores null inputs (gap-filled buckets feed nulls); `count`
//! counts only present values. `median` buffers its inputs and sorts lazily
//! on the first result read. `first`/`last` respect arrival order, which the
//! query pipeline guarantees is time-ascending within a bucket.

use std::str::FromStr;

use crate::error::QueryError;

/// The aggregation functions of the query API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorKind {
    /// Arithmetic mean
    Avg,
    /// 50th percentile
    Median,
    /// Sum
    Sum,
    /// Count of present values
    Count,
    /// Minimum
    Min,
    /// Maximum
    Max,
    /// Earliest value by arrival order
    First,
    /// Latest value by arrival order
    Last,
}

impl AggregatorKind {
    /// Wire name of the function
    pub fn name(&self) -> &'static str {
        match self {
            Self::Avg => "avg",
            Self::Median => "median",
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::First => "first",
            Self::Last => "last",
        }
    }
}

impl FromStr for AggregatorKind {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avg" | "mean" => Ok(Self::Avg),
            "median" => Ok(Self::Median),
            "sum" => Ok(Self::Sum),
            "count" => Ok(Self::Count),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            other => Err(QueryError::InvalidAggregator(other.to_string())),
        }
    }
}

/// A single streaming fold
#[derive(Debug, Clone)]
pub enum Aggregator {
    /// Running mean
    Avg {
        /// Sum of values seen
        sum: f64,
        /// Count of values seen
        count: u64,
    },
    /// Buffered median; sorted on first result read
    Median {
        /// Buffered values
        values: Vec<f64>,
        /// Whether the buffer is already sorted
        sorted: bool,
    },
    /// Running sum
    Sum(Option<f64>),
    /// Count of present values
    Count(u64),
    /// Running minimum
    Min(Option<f64>),
    /// Running maximum
    Max(Option<f64>),
    /// First value by arrival order
    First(Option<f64>),
    /// Last value by arrival order
    Last(Option<f64>),
}

impl Aggregator {
    /// Create a fresh fold of the given kind
    pub fn new(kind: AggregatorKind) -> Self {
        match kind {
            AggregatorKind::Avg => Self::Avg { sum: 0.0, count: 0 },
            AggregatorKind::Median => Self::Median {
                values: Vec::new(),
                sorted: false,
            },
            AggregatorKind::Sum => Self::Sum(None),
            AggregatorKind::Count => Self::Count(0),
            AggregatorKind::Min => Self::Min(None),
            AggregatorKind::Max => Self::Max(None),
            AggregatorKind::First => Self::First(None),
            AggregatorKind::Last => Self::Last(None),
        }
    }

    /// Fold one value; `None` inputs are ignored by every kind
    pub fn add(&mut self, value: Option<f64>) {
        let Some(value) = value else {
            return;
        };
        match self {
            Self::Avg { sum, count } => {
                *sum += value;
                *count += 1;
            }
            Self::Median { values, sorted } => {
                values.push(value);
                *sorted = false;
            }
            Self::Sum(acc) => *acc = Some(acc.unwrap_or(0.0) + value),
            Self::Count(n) => *n += 1,
            Self::Min(acc) => *acc = Some(acc.map_or(value, |m| m.min(value))),
            Self::Max(acc) => *acc = Some(acc.map_or(value, |m| m.max(value))),
            Self::First(acc) => {
                if acc.is_none() {
                    *acc = Some(value);
                }
            }
            Self::Last(acc) => *acc = Some(value),
        }
    }

    /// The folded result; `None` when no values were present
    pub fn result(&mut self) -> Option<f64> {
        match self {
            Self::Avg { sum, count } => (*count > 0).then(|| *sum / *count as f64),
            Self::Median { values, sorted } => {
                if values.is_empty() {
                    return None;
                }
                if !*sorted {
                    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                    *sorted = true;
                }
                let mid = values.len() / 2;
                if values.len() % 2 == 1 {
                    Some(values[mid])
                } else {
                    Some((values[mid - 1] + values[mid]) / 2.0)
                }
            }
            Self::Sum(acc) | Self::Min(acc) | Self::Max(acc) | Self::First(acc)
            | Self::Last(acc) => *acc,
            Self::Count(n) => Some(*n as f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(kind: AggregatorKind, values: &[Option<f64>]) -> Option<f64> {
        let mut agg = Aggregator::new(kind);
        for v in values {
            agg.add(*v);
        }
        agg.result()
    }

    #[test]
    fn test_avg() {
        assert_eq!(
            fold(AggregatorKind::Avg, &[Some(1.0), Some(2.0), Some(3.0)]),
            Some(2.0)
        );
    }

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(
            fold(AggregatorKind::Median, &[Some(3.0), Some(1.0), Some(2.0)]),
            Some(2.0)
        );
        assert_eq!(
            fold(
                AggregatorKind::Median,
                &[Some(4.0), Some(1.0), Some(3.0), Some(2.0)]
            ),
            Some(2.5)
        );
    }

    #[test]
    fn test_min_max_sum_count() {
        let values = [Some(5.0), Some(-1.0), Some(3.0)];
        assert_eq!(fold(AggregatorKind::Min, &values), Some(-1.0));
        assert_eq!(fold(AggregatorKind::Max, &values), Some(5.0));
        assert_eq!(fold(AggregatorKind::Sum, &values), Some(7.0));
        assert_eq!(fold(AggregatorKind::Count, &values), Some(3.0));
    }

    #[test]
    fn test_first_last_arrival_order() {
        let values = [Some(5.0), Some(-1.0), Some(3.0)];
        assert_eq!(fold(AggregatorKind::First, &values), Some(5.0));
        assert_eq!(fold(AggregatorKind::Last, &values), Some(3.0));
    }

    #[test]
    fn test_nulls_are_ignored_by_every_kind() {
        let with_nulls = [None, Some(1.0), None, Some(3.0), None];
        let without = [Some(1.0), Some(3.0)];
        for kind in [
            AggregatorKind::Avg,
            AggregatorKind::Median,
            AggregatorKind::Sum,
            AggregatorKind::Count,
            AggregatorKind::Min,
            AggregatorKind::Max,
            AggregatorKind::First,
            AggregatorKind::Last,
        ] {
            assert_eq!(fold(kind, &with_nulls), fold(kind, &without), "{:?}", kind);
        }
    }

    #[test]
    fn test_empty_fold_yields_none() {
        for kind in [
            AggregatorKind::Avg,
            AggregatorKind::Median,
            AggregatorKind::Sum,
            AggregatorKind::Min,
            AggregatorKind::Max,
            AggregatorKind::First,
            AggregatorKind::Last,
        ] {
            assert_eq!(fold(kind, &[]), None, "{:?}", kind);
        }
        // count of an empty fold is zero, not absent
        assert_eq!(fold(AggregatorKind::Count, &[]), Some(0.0));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("avg".parse::<AggregatorKind>().unwrap(), AggregatorKind::Avg);
        assert_eq!(
            "median".parse::<AggregatorKind>().unwrap(),
            AggregatorKind::Median
        );
        assert!("p99".parse::<AggregatorKind>().is_err());
    }
}
