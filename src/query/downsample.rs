//! Downsample specifications and their SQL fragments
//!
//! Wire form `<quantity><unit>-<agg>[-<fill>]`, e.g. `1m-sum-zero`. The unit
//! `all` (canonically `0all`) collapses the whole query range into a single
//! bucket per series, stamped with the query start.
//!
//! Bucket labels sit on the ceiling boundary: the label of the bucket
//! covering `(t0, t0 + w]` is `t0 + w`, computed in SQL as
//! `time_bucket(w, time) + w`. Together with a ceiled end bound this gives
//! OpenTSDB-parity alignment (an hour query over `[00:30, 03:15]` yields the
//! buckets `01:00..04:00`).

use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::error::QueryError;
use crate::query::aggregator::AggregatorKind;

/// How gap-filled (empty) buckets are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillPolicy {
    /// No gap-fill; empty buckets are absent
    #[default]
    None,
    /// Emit NaN for empty buckets
    Nan,
    /// Emit null for empty buckets
    Null,
    /// Emit zero for empty buckets
    Zero,
}

impl FromStr for FillPolicy {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "nan" => Ok(Self::Nan),
            "null" => Ok(Self::Null),
            "zero" => Ok(Self::Zero),
            other => Err(QueryError::InvalidDownsample(format!(
                "unknown fill policy '{}'",
                other
            ))),
        }
    }
}

/// A parsed downsample specification
#[derive(Debug, Clone)]
pub struct Downsample {
    /// Bucket width; `None` is the `all` sentinel (one bucket per series)
    pub bucket: Option<Duration>,
    /// Per-series aggregation function applied inside each bucket
    pub kind: AggregatorKind,
    /// Gap-fill rendering
    pub fill: FillPolicy,
}

impl Downsample {
    /// A whole-range downsample with the given function (the implicit shape
    /// of an aggregated query without an explicit downsample)
    pub fn all(kind: AggregatorKind) -> Self {
        Self {
            bucket: None,
            kind,
            fill: FillPolicy::None,
        }
    }

    /// The SQL aggregate expression for this function
    ///
    /// Only fixed identifiers are interpolated; everything else in the row
    /// query is a bound parameter.
    pub fn aggregate_expr(&self) -> &'static str {
        match self.kind {
            AggregatorKind::Avg => "avg(value)",
            AggregatorKind::Median => "percentile_cont(0.5) within group (order by value)",
            AggregatorKind::Sum => "sum(value)",
            AggregatorKind::Count => "count(1)::float8",
            AggregatorKind::Min => "min(value)",
            AggregatorKind::Max => "max(value)",
            AggregatorKind::First => "first(value, time)",
            AggregatorKind::Last => "last(value, time)",
        }
    }

    /// Whether gap-fill buckets are requested
    pub fn gapfill(&self) -> bool {
        self.fill != FillPolicy::None && self.bucket.is_some()
    }

    /// The bucket interval rendered for a `::interval` cast
    pub fn interval_text(&self) -> Option<String> {
        self.bucket
            .map(|b| format!("{} microseconds", b.num_microseconds().unwrap_or(i64::MAX)))
    }
}

impl FromStr for Downsample {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('-');
        let bucket_spec = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| QueryError::InvalidDownsample(format!("empty bucket in '{}'", s)))?;
        let agg = parts.next().ok_or_else(|| {
            QueryError::InvalidDownsample(format!("missing aggregator in '{}'", s))
        })?;
        let fill = parts.next();
        if parts.next().is_some() {
            return Err(QueryError::InvalidDownsample(format!(
                "trailing garbage in '{}'",
                s
            )));
        }

        let bucket = parse_bucket(bucket_spec)?;
        let kind = agg.parse()?;
        let fill = fill.map(FillPolicy::from_str).transpose()?.unwrap_or_default();

        Ok(Self { bucket, kind, fill })
    }
}

/// Parse `<quantity><unit>` where unit may be the `all` sentinel
fn parse_bucket(spec: &str) -> Result<Option<Duration>, QueryError> {
    let digits = spec.chars().take_while(|c| c.is_ascii_digit()).count();
    let unit = &spec[digits..];
    if unit == "all" {
        return Ok(None);
    }
    if digits == 0 {
        return Err(QueryError::InvalidDownsample(format!(
            "missing bucket quantity in '{}'",
            spec
        )));
    }
    let bucket = crate::query::time::parse_duration(spec)
        .map_err(|_| QueryError::InvalidDownsample(format!("bad bucket '{}'", spec)))?;
    if bucket <= Duration::zero() {
        return Err(QueryError::InvalidDownsample(format!(
            "non-positive bucket '{}'",
            spec
        )));
    }
    Ok(Some(bucket))
}

/// Round `t` up to the next multiple of `bucket` (identity on boundaries)
pub fn ceil_to_bucket(t: DateTime<Utc>, bucket: Duration) -> DateTime<Utc> {
    let width = bucket.num_microseconds().unwrap_or(i64::MAX);
    if width <= 0 {
        return t;
    }
    let micros = t.timestamp_micros();
    let rem = micros.rem_euclid(width);
    let ceiled = if rem == 0 { micros } else { micros - rem + width };
    match Utc.timestamp_micros(ceiled) {
        chrono::LocalResult::Single(dt) => dt,
        _ => t,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let ds: Downsample = "1m-sum".parse().unwrap();
        assert_eq!(ds.bucket, Some(Duration::minutes(1)));
        assert_eq!(ds.kind, AggregatorKind::Sum);
        assert_eq!(ds.fill, FillPolicy::None);
    }

    #[test]
    fn test_parse_with_fill() {
        let ds: Downsample = "5m-avg-zero".parse().unwrap();
        assert_eq!(ds.bucket, Some(Duration::minutes(5)));
        assert_eq!(ds.kind, AggregatorKind::Avg);
        assert_eq!(ds.fill, FillPolicy::Zero);
        assert!(ds.gapfill());
    }

    #[test]
    fn test_parse_all_sentinel() {
        let ds: Downsample = "0all-max".parse().unwrap();
        assert_eq!(ds.bucket, None);
        assert_eq!(ds.kind, AggregatorKind::Max);
        assert!(!ds.gapfill());
    }

    #[test]
    fn test_parse_units() {
        assert_eq!(
            "500ms-sum".parse::<Downsample>().unwrap().bucket,
            Some(Duration::milliseconds(500))
        );
        assert_eq!(
            "1h-sum".parse::<Downsample>().unwrap().bucket,
            Some(Duration::hours(1))
        );
        assert_eq!(
            "1n-sum".parse::<Downsample>().unwrap().bucket,
            Some(Duration::days(30))
        );
        assert_eq!(
            "1y-sum".parse::<Downsample>().unwrap().bucket,
            Some(Duration::days(365))
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("".parse::<Downsample>().is_err());
        assert!("1m".parse::<Downsample>().is_err());
        assert!("0m-sum".parse::<Downsample>().is_err());
        assert!("1m-p99".parse::<Downsample>().is_err());
        assert!("1m-sum-maybe".parse::<Downsample>().is_err());
        assert!("1m-sum-zero-extra".parse::<Downsample>().is_err());
    }

    #[test]
    fn test_ceil_to_bucket() {
        use chrono::TimeZone;
        let bucket = Duration::hours(1);
        let at = |h: u32, m: u32| Utc.with_ymd_and_hms(2023, 6, 15, h, m, 0).unwrap();

        assert_eq!(ceil_to_bucket(at(0, 30), bucket), at(1, 0));
        assert_eq!(ceil_to_bucket(at(3, 15), bucket), at(4, 0));
        // Boundary stays put
        assert_eq!(ceil_to_bucket(at(2, 0), bucket), at(2, 0));
    }

    #[test]
    fn test_median_uses_percentile_cont() {
        let ds: Downsample = "1m-median".parse().unwrap();
        assert!(ds.aggregate_expr().contains("percentile_cont(0.5)"));
    }
}
