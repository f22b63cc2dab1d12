//! Error types for the ledger-forecast library.

use thiserror::Error;

/// Result type alias for forecasting operations.
pub type Result<T> = std::result::Result<T, ForecastError>;

/// Errors that can occur during forecasting operations.
///
/// Recoverable negative outcomes (eligibility rejection, a filtered-out
/// model grid) are ordinary return values, not errors; only conditions that
/// abandon a fit or invalidate a whole hierarchy tree surface here.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ForecastError {
    /// Input data is empty.
    #[error("empty input data")]
    EmptyData,

    /// Insufficient data points for the operation.
    #[error("insufficient data: need at least {needed}, got {got}")]
    InsufficientData { needed: usize, got: usize },

    /// Invalid parameter value.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Dimension mismatch between data structures.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Month-index related error (ordering, duplicates, non-month-start).
    #[error("month index error: {0}")]
    MonthIndexError(String),

    /// Model has not been fitted yet.
    #[error("model must be fitted before prediction")]
    FitRequired,

    /// A single grid-search candidate exceeded its time budget.
    ///
    /// Recovered by excluding that candidate, never the whole account.
    #[error("model fit exceeded its time budget")]
    FitTimeout,

    /// Every grid candidate was filtered out or failed to fit.
    ///
    /// Recovered by routing the account to the statistical fallback.
    #[error("no surviving model candidate after grid search")]
    NoSurvivingCandidate,

    /// A hierarchy node's children do not jointly cover its account set.
    ///
    /// Fatal for that tree: indicates a classification or prefix-table
    /// defect and must be surfaced, not silently patched.
    #[error("hierarchy mismatch at prefix {prefix}: {detail}")]
    HierarchyMismatch { prefix: String, detail: String },

    /// Computation error (e.g., singular system, numerical issues).
    #[error("computation error: {0}")]
    ComputationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_are_descriptive() {
        let err = ForecastError::EmptyData;
        assert_eq!(err.to_string(), "empty input data");

        let err = ForecastError::InsufficientData { needed: 24, got: 7 };
        assert_eq!(err.to_string(), "insufficient data: need at least 24, got 7");

        let err = ForecastError::HierarchyMismatch {
            prefix: "601".to_string(),
            detail: "children cover 4 of 5 accounts".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "hierarchy mismatch at prefix 601: children cover 4 of 5 accounts"
        );

        let err = ForecastError::NoSurvivingCandidate;
        assert_eq!(
            err.to_string(),
            "no surviving model candidate after grid search"
        );
    }

    #[test]
    fn errors_are_clonable_and_comparable() {
        let err1 = ForecastError::FitTimeout;
        let err2 = err1.clone();
        assert_eq!(err1, err2);
    }
}
