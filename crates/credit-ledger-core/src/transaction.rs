//! Ledger transaction records.
//!
//! Every balance mutation appends one record. Records are never updated or
//! deleted; they exist so a deduction whose refund was lost can be reconciled
//! by hand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{PlanId, TransactionId, UserId};

/// A single balance mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    /// Unique transaction ID (ULID for time-ordering).
    pub id: TransactionId,

    /// The user whose balance was affected.
    pub user_id: UserId,

    /// What kind of mutation this was.
    pub action: LedgerAction,

    /// Magnitude of the change. Always positive; `action` gives the direction.
    /// For grants this is the entitlement the balance was reset to.
    pub amount: i64,

    /// Why the mutation happened (caller supplied).
    pub reason: String,

    /// Balance after this mutation.
    pub balance_after: i64,

    /// When the mutation happened.
    pub created_at: DateTime<Utc>,
}

impl LedgerTransaction {
    /// Build a record for a mutation that has just been applied.
    #[must_use]
    pub fn new(
        user_id: UserId,
        action: LedgerAction,
        amount: i64,
        reason: impl Into<String>,
        balance_after: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            user_id,
            action,
            amount,
            reason: reason.into(),
            balance_after,
            created_at,
        }
    }

    /// Build a grant record for `plan_id`.
    #[must_use]
    pub fn grant(
        user_id: UserId,
        plan_id: &PlanId,
        credits: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            user_id,
            LedgerAction::Grant,
            credits,
            format!("{plan_id} plan credit grant"),
            credits,
            created_at,
        )
    }

    /// Signed change this record applied, where computable.
    ///
    /// Grants reset the balance, so their delta is not recoverable from the
    /// record alone and `None` is returned.
    #[must_use]
    pub const fn signed_amount(&self) -> Option<i64> {
        match self.action {
            LedgerAction::Add | LedgerAction::Refund => Some(self.amount),
            LedgerAction::Deduct => Some(-self.amount),
            LedgerAction::Grant => None,
        }
    }
}

/// Kind of balance mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerAction {
    /// Credits added (purchase, bonus, admin).
    Add,

    /// Credits deducted for billable work.
    Deduct,

    /// Credits returned after billable work failed.
    Refund,

    /// Balance reset to a plan entitlement.
    Grant,
}

impl LedgerAction {
    /// Get the action name as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Deduct => "deduct",
            Self::Refund => "refund",
            Self::Grant => "grant",
        }
    }
}

impl std::str::FromStr for LedgerAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Self::Add),
            "deduct" => Ok(Self::Deduct),
            "refund" => Ok(Self::Refund),
            "grant" => Ok(Self::Grant),
            other => Err(format!("unknown ledger action: {other}")),
        }
    }
}
