//! Error types for ledger storage.

use credit_ledger_core::LedgerError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// The database could not be reached (pool exhausted, connection refused).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The credit would overflow the stored balance. Nothing was written.
    #[error("balance overflow adding {amount}")]
    BalanceOverflow {
        /// The rejected amount.
        amount: i64,
    },
}

impl StoreError {
    /// Map a credit rejected by the core balance type.
    pub(crate) fn from_credit(err: LedgerError) -> Self {
        match err {
            LedgerError::BalanceOverflow { amount } => Self::BalanceOverflow { amount },
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => Self::StoreUnavailable(msg),
            StoreError::Database(msg) | StoreError::Serialization(msg) => Self::Storage(msg),
            StoreError::BalanceOverflow { amount } => Self::BalanceOverflow { amount },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_maps_to_retryable_ledger_error() {
        let err: LedgerError = StoreError::Unavailable("pool timed out".into()).into();
        assert!(err.is_retryable());

        let err: LedgerError = StoreError::Database("syntax".into()).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn overflow_keeps_its_amount() {
        let err: LedgerError = StoreError::BalanceOverflow { amount: 7 }.into();
        assert!(matches!(err, LedgerError::BalanceOverflow { amount: 7 }));
    }
}
