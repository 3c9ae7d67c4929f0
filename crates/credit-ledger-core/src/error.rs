//! Error types for the credit ledger.

use crate::ids::IdError;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur in ledger operations.
///
/// An insufficient balance is deliberately absent: it is reported through
/// [`crate::DeductOutcome::Insufficient`] so callers branch on it instead of
/// treating it as a failure.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Amount was zero or negative.
    #[error("invalid amount: {amount} (must be positive)")]
    InvalidAmount {
        /// The rejected amount.
        amount: i64,
    },

    /// User identifier was malformed.
    #[error("invalid user: {0}")]
    InvalidUser(#[source] IdError),

    /// The backing store could not be reached in time. Retryable.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The backing store rejected the operation.
    #[error("storage error: {0}")]
    Storage(String),

    /// The requested plan is not in the catalog.
    #[error("plan not found: {plan_id}")]
    PlanNotFound {
        /// The plan that was looked up.
        plan_id: String,
    },

    /// Crediting would push the balance past `i64::MAX`.
    #[error("balance overflow: adding {amount} exceeds the maximum balance")]
    BalanceOverflow {
        /// The amount that was rejected.
        amount: i64,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl LedgerError {
    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_unavailable_is_retryable() {
        assert!(LedgerError::StoreUnavailable("timeout".into()).is_retryable());
        assert!(!LedgerError::InvalidAmount { amount: 0 }.is_retryable());
        assert!(!LedgerError::Storage("constraint".into()).is_retryable());
        assert!(!LedgerError::InvalidUser(IdError::Empty).is_retryable());
        assert!(!LedgerError::BalanceOverflow { amount: 1 }.is_retryable());
    }

    #[test]
    fn invalid_amount_message_names_the_amount() {
        let err = LedgerError::InvalidAmount { amount: -5 };
        assert_eq!(err.to_string(), "invalid amount: -5 (must be positive)");
    }
}
