//! Wire date-time parsing and formatting
//!
//! Venue feeds carry timestamps in several encodings: fixed-width decimal
//! (`YYYYMMDD`, `YYYYMMDDHHMMSSmmm`), FIX (`YYYYMMDD-HH:MM:SS[.mmm]`),
//! ISO-8601 (`YYYY-MM-DDTHH:MM:SS.mmm[uuu]` with `Z` or `+/-HH:MM` suffix)
//! and SQL (`YYYY-MM-DD HH:MM:SS.mmm[uuu]`). The non-strict parsers validate
//! shape (digits and separators) only and return `None` on malformed input;
//! the `_strict` variants additionally range-validate calendar fields via
//! `chrono` and report what went wrong.

use crate::types::Ts;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use thiserror::Error;

/// Wire time parsing failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeParseError {
    /// Wrong length, non-digit where a digit is required, or bad separator
    #[error("malformed date-time field: {0}")]
    Malformed(&'static str),

    /// Digits parsed but a calendar/clock field is out of range
    #[error("date-time field out of range: {0}")]
    FieldRange(&'static str),
}

/// Parse a run of ASCII digits, rejecting anything else.
fn digits(b: &[u8]) -> Option<u64> {
    if b.is_empty() {
        return None;
    }
    let mut v: u64 = 0;
    for &c in b {
        if !c.is_ascii_digit() {
            return None;
        }
        v = v * 10 + u64::from(c - b'0');
    }
    Some(v)
}

/// Days since 1970-01-01 for a civil date (proleptic Gregorian).
const fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = if m > 2 { m - 3 } else { m + 9 };
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

/// Assemble a nanosecond timestamp from split fields, without calendar
/// validation. Returns `None` only if the result falls outside `Ts` range.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn ts_from_parts(y: i64, m: i64, d: i64, h: i64, min: i64, s: i64, nanos: i64) -> Option<Ts> {
    let days = days_from_civil(y, m, d);
    let secs = (days as i128) * 86_400 + (h as i128) * 3_600 + (min as i128) * 60 + s as i128;
    let total = secs * 1_000_000_000 + nanos as i128;
    if total < 0 || total > u64::MAX as i128 {
        return None;
    }
    Some(Ts::from_nanos(total as u64))
}

/// Parse `YYYYMMDD` into midnight-UTC nanoseconds.
#[must_use]
pub fn ts_from_yyyymmdd(b: &[u8]) -> Option<Ts> {
    if b.len() != 8 {
        return None;
    }
    let y = digits(&b[0..4])? as i64;
    let m = digits(&b[4..6])? as i64;
    let d = digits(&b[6..8])? as i64;
    ts_from_parts(y, m, d, 0, 0, 0, 0)
}

/// Parse fixed-width `YYYYMMDDHHMMSSmmm`.
#[must_use]
pub fn ts_from_fixed17(b: &[u8]) -> Option<Ts> {
    if b.len() != 17 {
        return None;
    }
    let y = digits(&b[0..4])? as i64;
    let m = digits(&b[4..6])? as i64;
    let d = digits(&b[6..8])? as i64;
    let h = digits(&b[8..10])? as i64;
    let mi = digits(&b[10..12])? as i64;
    let s = digits(&b[12..14])? as i64;
    let ms = digits(&b[14..17])? as i64;
    ts_from_parts(y, m, d, h, mi, s, ms * 1_000_000)
}

/// Parse FIX `YYYYMMDD-HH:MM:SS` with optional `.mmm`.
#[must_use]
pub fn ts_from_fix(b: &[u8]) -> Option<Ts> {
    if b.len() != 17 && b.len() != 21 {
        return None;
    }
    if b[8] != b'-' || b[11] != b':' || b[14] != b':' {
        return None;
    }
    let y = digits(&b[0..4])? as i64;
    let m = digits(&b[4..6])? as i64;
    let d = digits(&b[6..8])? as i64;
    let h = digits(&b[9..11])? as i64;
    let mi = digits(&b[12..14])? as i64;
    let s = digits(&b[15..17])? as i64;
    let ms = if b.len() == 21 {
        if b[17] != b'.' {
            return None;
        }
        digits(&b[18..21])? as i64
    } else {
        0
    };
    ts_from_parts(y, m, d, h, mi, s, ms * 1_000_000)
}

/// Split a `YYYY-MM-DD<sep>HH:MM:SS.fff[fff]` body; returns
/// `(y, m, d, h, min, s, nanos, bytes_consumed)`.
#[allow(clippy::type_complexity)]
fn split_dashed(b: &[u8], sep: u8) -> Option<(i64, i64, i64, i64, i64, i64, i64, usize)> {
    if b.len() < 19 {
        return None;
    }
    if b[4] != b'-' || b[7] != b'-' || b[10] != sep || b[13] != b':' || b[16] != b':' {
        return None;
    }
    let y = digits(&b[0..4])? as i64;
    let m = digits(&b[5..7])? as i64;
    let d = digits(&b[8..10])? as i64;
    let h = digits(&b[11..13])? as i64;
    let mi = digits(&b[14..16])? as i64;
    let s = digits(&b[17..19])? as i64;
    let mut nanos: i64 = 0;
    let mut used = 19;
    if b.len() > 19 && b[19] == b'.' {
        // 3-digit (milli) or 6-digit (micro) fraction
        if b.len() >= 26 && b[20..26].iter().all(u8::is_ascii_digit) {
            nanos = digits(&b[20..26])? as i64 * 1_000;
            used = 26;
        } else if b.len() >= 23 {
            nanos = digits(&b[20..23])? as i64 * 1_000_000;
            used = 23;
        } else {
            return None;
        }
    }
    Some((y, m, d, h, mi, s, nanos, used))
}

/// Parse ISO-8601 `YYYY-MM-DDTHH:MM:SS.mmm[uuu]` followed by `Z`, a
/// `+/-HH:MM` offset, or nothing.
///
/// The offset digits are validated but not applied: the timestamp is
/// treated as UTC regardless of the suffix. Feeds consumed so far always
/// send `Z` or `+00:00`, so the arithmetic stays disabled to keep behavior
/// identical across venues.
#[must_use]
pub fn ts_from_iso8601(b: &[u8]) -> Option<Ts> {
    let (y, m, d, h, mi, s, nanos, used) = split_dashed(b, b'T')?;
    let rest = &b[used..];
    match rest.len() {
        0 => {}
        1 => {
            if rest[0] != b'Z' {
                return None;
            }
        }
        6 => {
            if rest[0] != b'+' && rest[0] != b'-' {
                return None;
            }
            if rest[3] != b':' {
                return None;
            }
            digits(&rest[1..3])?;
            digits(&rest[4..6])?;
        }
        _ => return None,
    }
    ts_from_parts(y, m, d, h, mi, s, nanos)
}

/// Parse SQL `YYYY-MM-DD HH:MM:SS.mmm[uuu]`.
#[must_use]
pub fn ts_from_sql(b: &[u8]) -> Option<Ts> {
    let (y, m, d, h, mi, s, nanos, used) = split_dashed(b, b' ')?;
    if used != b.len() {
        return None;
    }
    ts_from_parts(y, m, d, h, mi, s, nanos)
}

/// Range-validate split fields through chrono and build the timestamp.
fn ts_strict(
    y: i64,
    m: i64,
    d: i64,
    h: i64,
    mi: i64,
    s: i64,
    nanos: i64,
) -> Result<Ts, TimeParseError> {
    let date = NaiveDate::from_ymd_opt(
        i32::try_from(y).map_err(|_| TimeParseError::FieldRange("year"))?,
        u32::try_from(m).map_err(|_| TimeParseError::FieldRange("month"))?,
        u32::try_from(d).map_err(|_| TimeParseError::FieldRange("day"))?,
    )
    .ok_or(TimeParseError::FieldRange("date"))?;
    let dt = date
        .and_hms_nano_opt(
            u32::try_from(h).map_err(|_| TimeParseError::FieldRange("hour"))?,
            u32::try_from(mi).map_err(|_| TimeParseError::FieldRange("minute"))?,
            u32::try_from(s).map_err(|_| TimeParseError::FieldRange("second"))?,
            u32::try_from(nanos).map_err(|_| TimeParseError::FieldRange("fraction"))?,
        )
        .ok_or(TimeParseError::FieldRange("time"))?;
    let nanos_total = Utc
        .from_utc_datetime(&dt)
        .timestamp_nanos_opt()
        .ok_or(TimeParseError::FieldRange("timestamp"))?;
    u64::try_from(nanos_total)
        .map(Ts::from_nanos)
        .map_err(|_| TimeParseError::FieldRange("timestamp"))
}

/// Strict FIX parse: shape and calendar validation.
pub fn ts_from_fix_strict(b: &[u8]) -> Result<Ts, TimeParseError> {
    if b.len() != 17 && b.len() != 21 {
        return Err(TimeParseError::Malformed("fix length"));
    }
    if b[8] != b'-' || b[11] != b':' || b[14] != b':' {
        return Err(TimeParseError::Malformed("fix separators"));
    }
    let field = |r: std::ops::Range<usize>, what| {
        digits(&b[r]).ok_or(TimeParseError::Malformed(what))
    };
    let y = field(0..4, "year")? as i64;
    let m = field(4..6, "month")? as i64;
    let d = field(6..8, "day")? as i64;
    let h = field(9..11, "hour")? as i64;
    let mi = field(12..14, "minute")? as i64;
    let s = field(15..17, "second")? as i64;
    let ms = if b.len() == 21 {
        if b[17] != b'.' {
            return Err(TimeParseError::Malformed("fix fraction"));
        }
        field(18..21, "millis")? as i64
    } else {
        0
    };
    ts_strict(y, m, d, h, mi, s, ms * 1_000_000)
}

/// Strict ISO-8601 parse: shape, suffix, and calendar validation. The
/// offset suffix is still not applied (see [`ts_from_iso8601`]).
pub fn ts_from_iso8601_strict(b: &[u8]) -> Result<Ts, TimeParseError> {
    let (y, m, d, h, mi, s, nanos, used) =
        split_dashed(b, b'T').ok_or(TimeParseError::Malformed("iso8601 body"))?;
    let rest = &b[used..];
    match rest.len() {
        0 => {}
        1 if rest[0] == b'Z' => {}
        6 if (rest[0] == b'+' || rest[0] == b'-')
            && rest[3] == b':'
            && digits(&rest[1..3]).is_some()
            && digits(&rest[4..6]).is_some() => {}
        _ => return Err(TimeParseError::Malformed("iso8601 suffix")),
    }
    ts_strict(y, m, d, h, mi, s, nanos)
}

#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
fn utc_of(ts: Ts) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.as_secs() as i64, (ts.as_nanos() % 1_000_000_000) as u32)
        .unwrap_or_default()
}

/// Format as FIX `YYYYMMDD-HH:MM:SS.mmm`.
#[must_use]
pub fn format_fix(ts: Ts) -> String {
    utc_of(ts).format("%Y%m%d-%H:%M:%S%.3f").to_string()
}

/// Format as ISO-8601 `YYYY-MM-DDTHH:MM:SS.mmmZ`.
#[must_use]
pub fn format_iso8601(ts: Ts) -> String {
    utc_of(ts).format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    // 2021-03-15 12:34:56 UTC
    const SECS: u64 = 1_615_811_696;

    #[test]
    fn fixed17_parses() {
        let ts = ts_from_fixed17(b"20210315123456789").unwrap();
        assert_eq!(ts.as_nanos(), SECS * 1_000_000_000 + 789_000_000);
    }

    #[test]
    fn yyyymmdd_is_midnight() {
        let ts = ts_from_yyyymmdd(b"20210315").unwrap();
        assert_eq!(ts.as_secs() % 86_400, 0);
        assert_eq!(ts.as_secs(), SECS - 12 * 3600 - 34 * 60 - 56);
    }

    #[test]
    fn fix_with_and_without_millis() {
        let a = ts_from_fix(b"20210315-12:34:56").unwrap();
        let b = ts_from_fix(b"20210315-12:34:56.789").unwrap();
        assert_eq!(a.as_secs(), SECS);
        assert_eq!(b.as_nanos() - a.as_nanos(), 789_000_000);
    }

    #[test]
    fn iso8601_millis_and_micros() {
        let a = ts_from_iso8601(b"2021-03-15T12:34:56.789Z").unwrap();
        let b = ts_from_iso8601(b"2021-03-15T12:34:56.789123Z").unwrap();
        assert_eq!(a.as_nanos(), SECS * 1_000_000_000 + 789_000_000);
        assert_eq!(b.as_nanos(), SECS * 1_000_000_000 + 789_123_000);
    }

    #[test]
    fn iso8601_offset_validated_but_not_applied() {
        let zulu = ts_from_iso8601(b"2021-03-15T12:34:56.000Z").unwrap();
        let plus = ts_from_iso8601(b"2021-03-15T12:34:56.000+05:30").unwrap();
        let minus = ts_from_iso8601(b"2021-03-15T12:34:56.000-04:00").unwrap();
        assert_eq!(zulu, plus);
        assert_eq!(zulu, minus);
        // Garbled offsets are still rejected
        assert_eq!(ts_from_iso8601(b"2021-03-15T12:34:56.000+0530"), None);
        assert_eq!(ts_from_iso8601(b"2021-03-15T12:34:56.000+aa:30"), None);
    }

    #[test]
    fn sql_parses() {
        let ts = ts_from_sql(b"2021-03-15 12:34:56.789").unwrap();
        assert_eq!(ts.as_nanos(), SECS * 1_000_000_000 + 789_000_000);
        assert_eq!(ts_from_sql(b"2021-03-15 12:34:56.789Z"), None);
    }

    #[rstest]
    #[case::short(b"2021031512345678" as &[u8])]
    #[case::non_digit(b"20210315x23456789")]
    #[case::empty(b"")]
    fn malformed_fixed17_is_none_not_panic(#[case] input: &[u8]) {
        assert_eq!(ts_from_fixed17(input), None);
    }

    #[rstest]
    #[case::bad_separator(b"20210315 12:34:56" as &[u8])]
    #[case::truncated(b"20210315-12:34")]
    #[case::letters(b"yyyymmdd-hh:mm:ss")]
    fn malformed_fix_is_none_not_panic(#[case] input: &[u8]) {
        assert_eq!(ts_from_fix(input), None);
    }

    #[test]
    fn non_strict_accepts_month_13_strict_rejects() {
        // Shape-only validation lets an out-of-range month through
        assert!(ts_from_fix(b"20211315-12:34:56").is_some());
        assert_eq!(
            ts_from_fix_strict(b"20211315-12:34:56"),
            Err(TimeParseError::FieldRange("date"))
        );
    }

    #[test]
    fn strict_iso_rejects_bad_suffix() {
        assert!(ts_from_iso8601_strict(b"2021-03-15T12:34:56.000Z").is_ok());
        assert_eq!(
            ts_from_iso8601_strict(b"2021-03-15T12:34:56.000Q"),
            Err(TimeParseError::Malformed("iso8601 suffix"))
        );
    }

    #[test]
    fn format_roundtrip() {
        let ts = Ts::from_nanos(SECS * 1_000_000_000 + 789_000_000);
        assert_eq!(format_fix(ts), "20210315-12:34:56.789");
        assert_eq!(format_iso8601(ts), "2021-03-15T12:34:56.789Z");
        assert_eq!(ts_from_fix(format_fix(ts).as_bytes()).unwrap(), ts);
    }

    proptest! {
        // Any millisecond-precision timestamp through year 2100 survives a
        // format/parse round trip in both encodings.
        #[test]
        fn format_parse_roundtrip(secs in 0u64..4_102_444_800u64, millis in 0u64..1000) {
            let ts = Ts::from_nanos(secs * 1_000_000_000 + millis * 1_000_000);
            prop_assert_eq!(ts_from_fix(format_fix(ts).as_bytes()), Some(ts));
            prop_assert_eq!(ts_from_iso8601(format_iso8601(ts).as_bytes()), Some(ts));
        }
    }
}
