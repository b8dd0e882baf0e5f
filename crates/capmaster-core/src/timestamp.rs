//! Decimal-seconds timestamp handling.
//!
//! The dissector reports `frame.time_epoch` as a decimal string with up to
//! nanosecond precision. The analysis pipeline keeps `f64` seconds for
//! ordering and overlap tests, but the database sink stores nanoseconds with
//! full precision, so the string-to-nanosecond path is exact integer math —
//! an `f64` multiply would silently drop sub-microsecond digits.

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Converts a decimal-seconds string (e.g. `"1716301882.123456789"`) into
/// nanoseconds since the epoch, preserving every digit present.
///
/// Fractional digits beyond the ninth are ignored; the dissector never emits
/// more. Returns `None` on anything that is not a plain decimal number.
///
/// # Examples
/// ```
/// use capmaster_core::timestamp::epoch_str_to_nanos;
///
/// assert_eq!(epoch_str_to_nanos("12.5"), Some(12_500_000_000));
/// assert_eq!(epoch_str_to_nanos("0.000000001"), Some(1));
/// assert_eq!(epoch_str_to_nanos("three"), None);
/// ```
pub fn epoch_str_to_nanos(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let (negative, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let (sec_part, frac_part) = match digits.split_once('.') {
        Some((sec, frac)) => (sec, frac),
        None => (digits, ""),
    };
    if sec_part.is_empty() || !sec_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !frac_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let seconds: i64 = sec_part.parse().ok()?;
    let mut frac_nanos: i64 = 0;
    for (position, byte) in frac_part.bytes().take(9).enumerate() {
        let digit = (byte - b'0') as i64;
        let scale = 10_i64.pow(8 - position as u32);
        frac_nanos += digit * scale;
    }

    let nanos = seconds.checked_mul(NANOS_PER_SEC)?.checked_add(frac_nanos)?;
    Some(if negative { -nanos } else { nanos })
}

/// Parses a decimal-seconds string into `f64` seconds for in-memory use
/// (time ranges, overlap tests). Precision here is microsecond-grade, which
/// is what the matcher needs; the sink never goes through this path.
pub fn epoch_str_to_seconds(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    value.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Renders a seconds timestamp as RFC3339 for human-facing report headers.
pub fn seconds_to_rfc3339(seconds: f64) -> Option<String> {
    let nanos = (seconds * 1_000_000_000.0) as i128;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
}

#[cfg(test)]
mod tests {
    use super::{epoch_str_to_nanos, epoch_str_to_seconds};

    #[test]
    fn whole_seconds() {
        assert_eq!(epoch_str_to_nanos("1716301882"), Some(1_716_301_882_000_000_000));
    }

    #[test]
    fn fractional_digits_are_preserved_exactly() {
        // 1716301882.123456789 is not representable in f64; the integer path
        // must keep the trailing nanoseconds.
        assert_eq!(
            epoch_str_to_nanos("1716301882.123456789"),
            Some(1_716_301_882_123_456_789)
        );
    }

    #[test]
    fn short_fractions_are_right_padded() {
        assert_eq!(epoch_str_to_nanos("5.25"), Some(5_250_000_000));
        assert_eq!(epoch_str_to_nanos("5."), Some(5_000_000_000));
    }

    #[test]
    fn round_trip_through_integer_division() {
        let nanos = epoch_str_to_nanos("1716301882.000001234").unwrap();
        assert_eq!(nanos / 1_000_000_000, 1_716_301_882);
        assert_eq!(nanos % 1_000_000_000, 1_234);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(epoch_str_to_nanos(""), None);
        assert_eq!(epoch_str_to_nanos("1.2.3"), None);
        assert_eq!(epoch_str_to_nanos("abc"), None);
        assert_eq!(epoch_str_to_nanos(".5"), None);
    }

    #[test]
    fn seconds_parse_matches_float() {
        assert_eq!(epoch_str_to_seconds("12.5"), Some(12.5));
        assert_eq!(epoch_str_to_seconds("nan"), None);
        assert_eq!(epoch_str_to_seconds(""), None);
    }
}
