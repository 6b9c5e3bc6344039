use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlannerError {
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Matrix is not positive definite: {0}")]
    NonPositiveDefinite(String),

    #[error("Infeasible constraint '{constraint}': {detail}")]
    InfeasibleConstraint { constraint: String, detail: String },

    #[error("Invalid value for '{field}': {reason}")]
    Validation { field: String, reason: String },

    #[error("Solver did not converge: {0}")]
    Convergence(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl PlannerError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn infeasible(constraint: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InfeasibleConstraint {
            constraint: constraint.into(),
            detail: detail.into(),
        }
    }

    /// Stable machine-readable name of the error kind, surfaced to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            PlannerError::InsufficientData(_) => "insufficient_data",
            PlannerError::NonPositiveDefinite(_) => "non_positive_definite",
            PlannerError::InfeasibleConstraint { .. } => "infeasible_constraint",
            PlannerError::Validation { .. } => "validation",
            PlannerError::Convergence(_) => "convergence",
            PlannerError::Cancelled => "cancelled",
        }
    }
}

pub type PlannerResult<T> = Result<T, PlannerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_input() {
        let err = PlannerError::validation("assets[1].volatility", "must be >= 0");
        assert_eq!(
            err.to_string(),
            "Invalid value for 'assets[1].volatility': must be >= 0"
        );
        assert_eq!(err.kind(), "validation");

        let err = PlannerError::infeasible("max_weight[AGG]", "bounds sum below 1");
        assert!(err.to_string().contains("max_weight[AGG]"));
        assert_eq!(err.kind(), "infeasible_constraint");
    }
}
