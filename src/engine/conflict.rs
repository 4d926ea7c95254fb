use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Reject windows that are empty, inverted, or outside the accepted range.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::try_new(start, end)
        .ok_or_else(|| EngineError::Validation(format!("end ({end}) must be after start ({start})")))?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_APPOINTMENT_DURATION_MS {
        return Err(EngineError::LimitExceeded("appointment too long"));
    }
    Ok(span)
}

/// First visible `Scheduled` appointment at the location whose window overlaps
/// `span`, ignoring `exclude`. Adjacent windows do not conflict.
pub fn find_conflict(ls: &LocationState, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    ls.blocking(span)
        .find(|a| exclude.is_none_or(|id| a.id != id))
        .map(|a| a.id)
}

pub(crate) fn check_no_conflict(
    ls: &LocationState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(ls, span, exclude) {
        Some(id) => {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            Err(EngineError::Conflict(id))
        }
        None => Ok(()),
    }
}
