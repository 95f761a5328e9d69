use ulid::Ulid;

use crate::model::*;

use super::overlap::{conflicts, OverlapPolicy};
use super::EngineError;

/// Wall-clock time in Unix milliseconds.
pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Turn raw request dates into a stay span, rejecting empty, inverted,
/// out-of-range and overlong stays.
pub(crate) fn validate_stay(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    let span = Span::try_new(start, end)
        .ok_or_else(|| EngineError::Validation("end date must be after start date".into()))?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::Validation("timestamp out of range".into()));
    }
    if span.duration_ms() > MAX_STAY_MS {
        return Err(EngineError::Validation("stay too long".into()));
    }
    Ok(span)
}

/// Reject `span` if any active booking on the property conflicts with it.
/// `exclude` skips one booking (used when re-activating it).
pub(crate) fn check_no_conflict(
    ps: &PropertyState,
    span: &Span,
    policy: OverlapPolicy,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    // Bookings are sorted by start; nothing starting after span.end can
    // intersect under either policy.
    let right_bound = ps.bookings.partition_point(|b| b.span.start <= span.end);
    for booking in &ps.bookings[..right_bound] {
        if !booking.status.is_active() || Some(booking.id) == exclude {
            continue;
        }
        if conflicts(&booking.span, span, policy) {
            return Err(EngineError::Conflict(booking.id));
        }
    }
    Ok(())
}
