//! OpenTSDB time specifications
//!
//! Accepted forms: `now`, relative `<n><unit>-ago`, numeric epoch (seconds
//! when at most ten digits or fractional, milliseconds otherwise), and
//! ISO-8601 strings. Relative units follow OpenTSDB: `ms`, `s`, `m`, `h`,
//! `d`, `w`, `n` (30 days), `y` (365 days).

use chrono::{DateTime, Duration, Utc};

use crate::error::QueryError;
use crate::types::datetime_from_epoch;

/// Parse a duration quantity + unit (`10m`, `500ms`, `2w`)
pub fn parse_duration(spec: &str) -> Result<Duration, QueryError> {
    let digits = spec.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return Err(QueryError::InvalidTimeSpec(format!(
            "missing quantity in '{}'",
            spec
        )));
    }
    let quantity: i64 = spec[..digits]
        .parse()
        .map_err(|_| QueryError::InvalidTimeSpec(format!("bad quantity in '{}'", spec)))?;
    let unit = &spec[digits..];

    let duration = match unit {
        "ms" => Duration::milliseconds(quantity),
        "s" => Duration::seconds(quantity),
        "m" => Duration::minutes(quantity),
        "h" => Duration::hours(quantity),
        "d" => Duration::days(quantity),
        "w" => Duration::weeks(quantity),
        "n" => Duration::days(quantity * 30),
        "y" => Duration::days(quantity * 365),
        other => {
            return Err(QueryError::InvalidTimeSpec(format!(
                "unknown unit '{}' in '{}'",
                other, spec
            )))
        }
    };
    Ok(duration)
}

/// Parse a time specification relative to `now`
pub fn parse_time_spec(spec: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, QueryError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(QueryError::InvalidTimeSpec("empty time spec".to_string()));
    }
    if spec.eq_ignore_ascii_case("now") {
        return Ok(now);
    }
    if let Some(relative) = spec.strip_suffix("-ago") {
        let duration = parse_duration(relative)?;
        return Ok(now - duration);
    }
    if let Ok(raw) = spec.parse::<f64>() {
        return datetime_from_epoch(raw)
            .ok_or_else(|| QueryError::InvalidTimeSpec(format!("epoch out of range '{}'", spec)));
    }
    DateTime::parse_from_rfc3339(spec)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| QueryError::InvalidTimeSpec(format!("unrecognized time spec '{}'", spec)))
}

/// A time spec as it appears in a request body: a JSON number or string
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(untagged)]
pub enum TimeSpec {
    /// Numeric epoch (seconds or milliseconds, per magnitude)
    Epoch(f64),
    /// `now`, `<n><unit>-ago`, numeric string, or ISO-8601
    Text(String),
}

impl TimeSpec {
    /// Resolve the spec against a reference instant
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, QueryError> {
        match self {
            Self::Epoch(raw) => datetime_from_epoch(*raw).ok_or_else(|| {
                QueryError::InvalidTimeSpec(format!("epoch out of range '{}'", raw))
            }),
            Self::Text(spec) => parse_time_spec(spec, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 6, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_now() {
        assert_eq!(parse_time_spec("now", now()).unwrap(), now());
        assert_eq!(parse_time_spec("NOW", now()).unwrap(), now());
    }

    #[test]
    fn test_relative_ago() {
        assert_eq!(
            parse_time_spec("1h-ago", now()).unwrap(),
            now() - Duration::hours(1)
        );
        assert_eq!(
            parse_time_spec("30s-ago", now()).unwrap(),
            now() - Duration::seconds(30)
        );
        assert_eq!(
            parse_time_spec("2w-ago", now()).unwrap(),
            now() - Duration::weeks(2)
        );
        assert_eq!(
            parse_time_spec("1n-ago", now()).unwrap(),
            now() - Duration::days(30)
        );
    }

    #[test]
    fn test_numeric_epoch_string() {
        let dt = parse_time_spec("1609459200", now()).unwrap();
        assert_eq!(dt.timestamp(), 1_609_459_200);

        // Eleven digits: milliseconds
        let dt = parse_time_spec("1609459200000", now()).unwrap();
        assert_eq!(dt.timestamp(), 1_609_459_200);

        // Fractional: seconds
        let dt = parse_time_spec("1609459200.25", now()).unwrap();
        assert_eq!(dt.timestamp_subsec_micros(), 250_000);
    }

    #[test]
    fn test_iso8601() {
        let dt = parse_time_spec("2021-01-01T00:00:00Z", now()).unwrap();
        assert_eq!(dt.timestamp(), 1_609_459_200);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_time_spec("", now()).is_err());
        assert!(parse_time_spec("h-ago", now()).err().is_some());
        assert!(parse_time_spec("10q-ago", now()).is_err());
        assert!(parse_time_spec("yesterday", now()).is_err());
    }
}
