//! Boundary conversions between external timestamps and internal `Ms`.
//!
//! Everything inside the engine is a UTC instant in milliseconds. Textual input
//! must carry an explicit offset; naive local times are rejected here and never
//! reach business logic.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::engine::EngineError;
use crate::model::Ms;

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Parse an RFC 3339 timestamp (`2025-03-01T10:00:00-03:00`) into UTC millis.
pub fn parse_timestamp(input: &str) -> Result<Ms, EngineError> {
    let trimmed = input.trim();
    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
        .map_err(|e| {
            EngineError::Validation(format!(
                "timestamp {trimmed:?} must be RFC 3339 with an explicit offset: {e}"
            ))
        })
}

pub fn to_datetime(ms: Ms) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

/// Render as RFC 3339 UTC, falling back to the raw number for out-of-range values.
pub fn format_timestamp(ms: Ms) -> String {
    match to_datetime(ms) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => ms.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_normalize_to_utc() {
        let sao_paulo = parse_timestamp("2025-03-01T10:00:00-03:00").unwrap();
        let utc = parse_timestamp("2025-03-01T13:00:00Z").unwrap();
        assert_eq!(sao_paulo, utc);
    }

    #[test]
    fn naive_timestamps_rejected() {
        assert!(matches!(
            parse_timestamp("2025-03-01T10:00:00"),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            parse_timestamp("2025-03-01 10:00"),
            Err(EngineError::Validation(_))
        ));
        assert!(parse_timestamp("").is_err());
    }

    #[test]
    fn format_roundtrips_through_parse() {
        let ms = parse_timestamp("2025-03-01T13:00:00.250Z").unwrap();
        assert_eq!(format_timestamp(ms), "2025-03-01T13:00:00.250Z");
        assert_eq!(parse_timestamp(&format_timestamp(ms)).unwrap(), ms);
    }

    #[test]
    fn now_is_recent() {
        let cutoff = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        assert!(now_ms() > cutoff);
    }
}
