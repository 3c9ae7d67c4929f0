//! Ledger handlers: balances, history and adjustment operations.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use credit_ledger_core::{Amount, DeductOutcome, LedgerTransaction, PlanId, UserId};

use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::state::AppState;

/// Upper bound on `limit` for transaction listings.
const MAX_TRANSACTIONS_PAGE: usize = 200;

/// Balance response.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    /// User ID.
    pub user_id: String,
    /// Current balance (0 for unknown users).
    pub balance: i64,
}

/// Get a user's balance.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Path(user_id): Path<String>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let user_id = UserId::new(user_id)?;
    let balance = state.ledger.get_balance(&user_id).await?;

    Ok(Json(BalanceResponse {
        user_id: user_id.into(),
        balance,
    }))
}

/// Transaction list query parameters.
#[derive(Debug, Deserialize)]
pub struct ListTransactionsQuery {
    /// Maximum number of transactions to return (default: 50).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset for pagination (default: 0).
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

/// Transaction response.
#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    /// Transaction ID.
    pub id: String,
    /// Mutation kind (`add`, `deduct`, `refund`, `grant`).
    pub action: String,
    /// Magnitude of the change.
    pub amount: i64,
    /// Caller-supplied reason.
    pub reason: String,
    /// Balance after this transaction.
    pub balance_after: i64,
    /// Timestamp.
    pub created_at: String,
}

impl From<&LedgerTransaction> for TransactionResponse {
    fn from(tx: &LedgerTransaction) -> Self {
        Self {
            id: tx.id.to_string(),
            action: tx.action.as_str().to_string(),
            amount: tx.amount,
            reason: tx.reason.clone(),
            balance_after: tx.balance_after,
            created_at: tx.created_at.to_rfc3339(),
        }
    }
}

/// Transaction list response.
#[derive(Debug, Serialize)]
pub struct TransactionsResponse {
    /// User ID.
    pub user_id: String,
    /// Transactions, newest first.
    pub transactions: Vec<TransactionResponse>,
}

/// List a user's transactions, newest first.
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Path(user_id): Path<String>,
    Query(query): Query<ListTransactionsQuery>,
) -> Result<Json<TransactionsResponse>, ApiError> {
    let user_id = UserId::new(user_id)?;
    let limit = query.limit.min(MAX_TRANSACTIONS_PAGE);

    let transactions = state
        .ledger
        .transactions(&user_id, limit, query.offset)
        .await?;

    Ok(Json(TransactionsResponse {
        user_id: user_id.into(),
        transactions: transactions.iter().map(TransactionResponse::from).collect(),
    }))
}

/// A ledger operation request.
///
/// Amounts and identifiers are validated while deserializing, so malformed
/// requests are rejected before any ledger call.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerOp {
    /// Deduct credits before billable work.
    Deduct {
        /// User to charge.
        user_id: UserId,
        /// Credits to deduct.
        amount: Amount,
        /// Why (e.g. "video generation").
        #[serde(default)]
        reason: Option<String>,
    },
    /// Add credits (purchase, bonus).
    Add {
        /// User to credit.
        user_id: UserId,
        /// Credits to add.
        amount: Amount,
        /// Why.
        #[serde(default)]
        reason: Option<String>,
    },
    /// Return credits after failed billable work.
    Refund {
        /// User to credit.
        user_id: UserId,
        /// Credits to return.
        amount: Amount,
        /// Why.
        #[serde(default)]
        reason: Option<String>,
    },
    /// Apply the periodic plan grant if due.
    Grant {
        /// User to grant.
        user_id: UserId,
        /// Plan whose entitlement applies.
        plan_id: PlanId,
    },
}

/// Ledger operation response.
#[derive(Debug, Serialize)]
pub struct OpResponse {
    /// User ID.
    pub user_id: String,
    /// Balance after the operation.
    pub balance: i64,
    /// Whether a grant was applied (grant operations only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granted: Option<bool>,
}

/// Apply a ledger operation.
///
/// An insufficient balance is answered with `402` and the required and
/// available amounts.
pub async fn apply_op(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    payload: Result<Json<LedgerOp>, JsonRejection>,
) -> Result<Json<OpResponse>, ApiError> {
    let Json(op) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let ledger = &state.ledger;

    let response = match op {
        LedgerOp::Deduct {
            user_id,
            amount,
            reason,
        } => {
            let reason = reason.unwrap_or_else(|| format!("deduct via {}", auth.service_name));
            match ledger.deduct(&user_id, amount, &reason).await? {
                DeductOutcome::Applied { balance } => OpResponse {
                    user_id: user_id.into(),
                    balance,
                    granted: None,
                },
                DeductOutcome::Insufficient {
                    available,
                    required,
                } => {
                    return Err(ApiError::InsufficientCredits {
                        available,
                        required,
                    })
                }
            }
        }
        LedgerOp::Add {
            user_id,
            amount,
            reason,
        } => {
            let reason = reason.unwrap_or_else(|| format!("add via {}", auth.service_name));
            let balance = ledger.add(&user_id, amount, &reason).await?;
            OpResponse {
                user_id: user_id.into(),
                balance,
                granted: None,
            }
        }
        LedgerOp::Refund {
            user_id,
            amount,
            reason,
        } => {
            let reason = reason.unwrap_or_else(|| format!("refund via {}", auth.service_name));
            let balance = ledger.refund(&user_id, amount, &reason).await?;
            OpResponse {
                user_id: user_id.into(),
                balance,
                granted: None,
            }
        }
        LedgerOp::Grant { user_id, plan_id } => {
            ledger.get_plan(&plan_id).await?;
            let outcome = ledger.grant_if_due(&user_id, &plan_id, Utc::now()).await?;
            OpResponse {
                user_id: user_id.into(),
                balance: outcome.balance,
                granted: Some(outcome.granted),
            }
        }
    };

    Ok(Json(response))
}
