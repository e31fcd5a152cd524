//! Common utilities and helper functions

pub mod retry;

use chrono::{DateTime, Utc};

/// Convert a timestamp to unix milliseconds, the storage representation
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Convert unix milliseconds back to a timestamp, clamping out-of-range values
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_roundtrip_preserves_precision() {
        let at = from_millis(1_700_000_000_123);
        assert_eq!(to_millis(at), 1_700_000_000_123);
    }
}
