//! Boundary checks shared by every operation's `validate()`.
//!
//! Each helper names the offending field so callers can point the user at
//! the exact input that was rejected.

use crate::error::{PlannerError, PlannerResult};

pub fn ensure_finite(value: f64, field: &str) -> PlannerResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(PlannerError::validation(field, format!("must be finite, got {value}")))
    }
}

pub fn ensure_non_negative(value: f64, field: &str) -> PlannerResult<()> {
    ensure_finite(value, field)?;
    if value < 0.0 {
        return Err(PlannerError::validation(field, format!("must be >= 0, got {value}")));
    }
    Ok(())
}

pub fn ensure_positive(value: f64, field: &str) -> PlannerResult<()> {
    ensure_finite(value, field)?;
    if value <= 0.0 {
        return Err(PlannerError::validation(field, format!("must be > 0, got {value}")));
    }
    Ok(())
}

/// Closed interval [0, 1].
pub fn ensure_probability(value: f64, field: &str) -> PlannerResult<()> {
    ensure_finite(value, field)?;
    if !(0.0..=1.0).contains(&value) {
        return Err(PlannerError::validation(
            field,
            format!("must lie in [0, 1], got {value}"),
        ));
    }
    Ok(())
}

/// Open interval (0, 1).
pub fn ensure_open_unit(value: f64, field: &str) -> PlannerResult<()> {
    ensure_finite(value, field)?;
    if value <= 0.0 || value >= 1.0 {
        return Err(PlannerError::validation(
            field,
            format!("must lie strictly between 0 and 1, got {value}"),
        ));
    }
    Ok(())
}

/// Rates such as expected returns may be negative but never below -100%.
pub fn ensure_rate(value: f64, field: &str) -> PlannerResult<()> {
    ensure_finite(value, field)?;
    if value <= -1.0 {
        return Err(PlannerError::validation(field, format!("must be > -1, got {value}")));
    }
    Ok(())
}
