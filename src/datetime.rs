// Date and time handling for $now, $millis, $fromMillis and $toMillis
// ISO 8601 text in and out, built on chrono

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use thiserror::Error;

use crate::error::Error;
use crate::value::JValue;

/// DateTime errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DateTimeError {
    #[error("The timestamp \"{0}\" is not in ISO 8601 format")]
    NotIso8601(String),

    #[error("The milliseconds value {0} is outside the representable range")]
    OutOfRange(f64),
}

impl From<DateTimeError> for Error {
    fn from(err: DateTimeError) -> Self {
        let value = match &err {
            DateTimeError::NotIso8601(text) => JValue::from(text.as_str()),
            DateTimeError::OutOfRange(n) => JValue::Number(*n),
        };
        Error::new("D3110", err.to_string()).with_value(Some(value))
    }
}

/// Local date-time layouts accepted when the text carries no offset
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

/// Layouts with a numeric offset written without a colon (`+0100`)
const OFFSET_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%dT%H:%M:%S%z"];

/// Parse an ISO 8601 timestamp. Text without an offset is taken as UTC.
pub fn parse_iso8601(s: &str) -> Result<DateTime<Utc>, DateTimeError> {
    let text = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Ok(dt.with_timezone(&Utc));
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    parse_date_only(text).ok_or_else(|| DateTimeError::NotIso8601(s.to_string()))
}

/// `YYYY-MM-DD`, `YYYY-MM` or `YYYY`, at midnight UTC
fn parse_date_only(text: &str) -> Option<DateTime<Utc>> {
    let mut parts = text.splitn(3, '-');
    let year = parts.next()?;
    if year.len() != 4 {
        return None;
    }
    let year: i32 = year.parse().ok()?;
    let month: u32 = match parts.next() {
        Some(m) if m.len() == 2 => m.parse().ok()?,
        Some(_) => return None,
        None => 1,
    };
    let day: u32 = match parts.next() {
        Some(d) if d.len() == 2 => d.parse().ok()?,
        Some(_) => return None,
        None => 1,
    };
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

/// Format a datetime as ISO 8601 in UTC with millisecond precision
pub fn format_iso8601(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Milliseconds since the epoch
pub fn to_millis(s: &str) -> Result<i64, DateTimeError> {
    parse_iso8601(s).map(|dt| dt.timestamp_millis())
}

/// ISO 8601 text for milliseconds since the epoch
pub fn from_millis(millis: f64) -> Result<String, DateTimeError> {
    if !millis.is_finite() {
        return Err(DateTimeError::OutOfRange(millis));
    }
    Utc.timestamp_millis_opt(millis.floor() as i64)
        .single()
        .map(|dt| format_iso8601(&dt))
        .ok_or(DateTimeError::OutOfRange(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_millis() {
        let millis = to_millis("2017-11-07T15:07:54.972Z").unwrap();
        assert_eq!(millis, 1510067274972);
        assert_eq!(from_millis(millis as f64).unwrap(), "2017-11-07T15:07:54.972Z");
    }

    #[test]
    fn test_offsets_are_normalised_to_utc() {
        assert_eq!(
            to_millis("2017-11-07T16:07:54.972+01:00").unwrap(),
            to_millis("2017-11-07T15:07:54.972Z").unwrap()
        );
        assert_eq!(
            to_millis("2017-11-07T16:07:54+0100").unwrap(),
            to_millis("2017-11-07T15:07:54Z").unwrap()
        );
    }

    #[test]
    fn test_partial_timestamps() {
        assert_eq!(to_millis("1970-01-02").unwrap(), 86_400_000);
        assert_eq!(to_millis("1970-01").unwrap(), 0);
        assert_eq!(to_millis("1970-01-01T00:01").unwrap(), 60_000);
    }

    #[test]
    fn test_malformed_timestamp() {
        let err = to_millis("yesterday").unwrap_err();
        assert_eq!(err, DateTimeError::NotIso8601("yesterday".to_string()));
        let err: Error = err.into();
        assert_eq!(err.code, "D3110");
    }

    #[test]
    fn test_format_uses_milliseconds() {
        let dt = Utc.timestamp_millis_opt(0).unwrap();
        assert_eq!(format_iso8601(&dt), "1970-01-01T00:00:00.000Z");
    }
}
