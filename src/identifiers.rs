//! Upstream identifier and timestamp normalization
//!
//! Upstream may hand back identifiers in canonical dashed UUID form or
//! compact 32-hex form; everything downstream of the client deals in
//! dashed form only. The all-zero sentinel is a valid "default child" id
//! and must round-trip, not be rejected as degenerate.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// Sentinel upstream id meaning "the default child of this parent".
pub const SENTINEL_ZERO_ID: Uuid = Uuid::nil();

/// Parse an upstream identifier in either dashed or compact (32-hex) form,
/// always returning the dashed `Uuid`. The zero sentinel is preserved.
pub fn normalize_upstream_id(raw: &str) -> Result<Uuid, uuid::Error> {
    if raw.len() == 32 && !raw.contains('-') {
        let dashed = format!(
            "{}-{}-{}-{}-{}",
            &raw[0..8],
            &raw[8..12],
            &raw[12..16],
            &raw[16..20],
            &raw[20..32]
        );
        Uuid::parse_str(&dashed)
    } else {
        Uuid::parse_str(raw)
    }
}

/// Upstream timestamps are Unix seconds or milliseconds; detected by
/// magnitude per spec (`> 10^10` implies milliseconds).
pub fn parse_upstream_timestamp(raw: i64) -> Option<DateTime<Utc>> {
    const MAGNITUDE_THRESHOLD: i64 = 10_000_000_000;
    if raw.abs() > MAGNITUDE_THRESHOLD {
        Utc.timestamp_millis_opt(raw).single()
    } else {
        Utc.timestamp_opt(raw, 0).single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_compact_to_dashed() {
        let compact = "550e8400e29b41d4a716446655440000";
        let dashed = normalize_upstream_id(compact).unwrap();
        assert_eq!(dashed.to_string(), "550e8400-e29b-41d4-a716-446655440000");
    }

    #[test]
    fn passes_through_dashed() {
        let dashed = "550e8400-e29b-41d4-a716-446655440000";
        assert_eq!(normalize_upstream_id(dashed).unwrap().to_string(), dashed);
    }

    #[test]
    fn preserves_zero_sentinel() {
        let compact_zero = "00000000000000000000000000000000";
        assert_eq!(normalize_upstream_id(compact_zero).unwrap(), SENTINEL_ZERO_ID);
    }

    #[test]
    fn detects_seconds_vs_millis() {
        let seconds = 1_700_000_000i64;
        let millis = 1_700_000_000_000i64;
        let a = parse_upstream_timestamp(seconds).unwrap();
        let b = parse_upstream_timestamp(millis).unwrap();
        assert_eq!(a.timestamp(), seconds);
        assert_eq!(b.timestamp(), seconds);
    }
}
