//! Request and response types for the credit ledger API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use credit_ledger_core::{Amount, PlanId, UserId};

// ============================================================================
// Requests
// ============================================================================

/// Body of `POST /v1/ledger/ops`.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum OpRequest<'a> {
    Deduct {
        user_id: &'a UserId,
        amount: Amount,
        reason: &'a str,
    },
    Add {
        user_id: &'a UserId,
        amount: Amount,
        reason: &'a str,
    },
    Refund {
        user_id: &'a UserId,
        amount: Amount,
        reason: &'a str,
    },
    Grant {
        user_id: &'a UserId,
        plan_id: &'a PlanId,
    },
}

// ============================================================================
// Responses
// ============================================================================

/// Balance response.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceResponse {
    /// User ID.
    pub user_id: String,
    /// Current balance (0 for unknown users).
    pub balance: i64,
}

/// Ledger operation response.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OpResponse {
    pub balance: i64,
    #[serde(default)]
    pub granted: Option<bool>,
}

/// A recorded balance mutation.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionEntry {
    /// Transaction ID.
    pub id: String,
    /// Mutation kind (`add`, `deduct`, `refund`, `grant`).
    pub action: String,
    /// Magnitude of the change.
    pub amount: i64,
    /// Reason given by the caller.
    pub reason: String,
    /// Balance after this transaction.
    pub balance_after: i64,
    /// When the transaction was recorded.
    pub created_at: DateTime<Utc>,
}

/// Transaction list response.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TransactionsResponse {
    pub transactions: Vec<TransactionEntry>,
}

/// Outcome of [`crate::LedgerClient::charge`].
#[derive(Debug)]
pub enum ChargeOutcome<T, E> {
    /// The credits were deducted and the work succeeded.
    Completed {
        /// What the work produced.
        output: T,
        /// Balance after the deduction.
        balance: i64,
    },

    /// The balance did not cover the charge; the work was not run.
    Insufficient {
        /// Balance at the time of the attempt.
        available: i64,
        /// Amount that was requested.
        required: i64,
    },

    /// The work failed after the deduction.
    Failed {
        /// The work's error.
        error: E,
        /// Whether the credits were returned.
        refunded: bool,
    },
}

/// API error response.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiErrorResponse {
    pub error: ApiErrorBody,
}

/// API error body.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

impl ApiErrorBody {
    /// Integer field from `details`, if present.
    pub fn detail_i64(&self, key: &str) -> Option<i64> {
        self.details
            .as_ref()
            .and_then(|d| d.get(key))
            .and_then(serde_json::Value::as_i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_request_is_tagged() {
        let user_id = UserId::new("u1").unwrap();
        let request = OpRequest::Deduct {
            user_id: &user_id,
            amount: Amount::new(5).unwrap(),
            reason: "video generation",
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "op": "deduct",
                "user_id": "u1",
                "amount": 5,
                "reason": "video generation"
            })
        );
    }

    #[test]
    fn error_details_are_read() {
        let body: ApiErrorResponse = serde_json::from_str(
            r#"{"error":{"code":"insufficient_credits","message":"no","details":{"required":5,"available":2}}}"#,
        )
        .unwrap();
        assert_eq!(body.error.detail_i64("required"), Some(5));
        assert_eq!(body.error.detail_i64("available"), Some(2));
        assert_eq!(body.error.detail_i64("missing"), None);
    }
}
