use crate::limits::DAY_MS;
use crate::model::Span;

use super::EngineError;

/// Total price of a stay: `nightly_rate × nights`, where nights is the
/// duration in days including any fractional part.
pub fn quote(nightly_rate: f64, span: &Span) -> Result<f64, EngineError> {
    if span.end <= span.start {
        return Err(EngineError::Validation("end date must be after start date".into()));
    }
    if !nightly_rate.is_finite() || nightly_rate < 0.0 {
        return Err(EngineError::Validation(format!("invalid nightly rate: {nightly_rate}")));
    }
    let nights = span.duration_ms() as f64 / DAY_MS as f64;
    Ok(nightly_rate * nights)
}
