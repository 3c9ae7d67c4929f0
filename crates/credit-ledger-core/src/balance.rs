//! Account balance types.
//!
//! One `AccountBalance` row exists per user. It is created lazily by the first
//! credit (or grant) and is only ever mutated through the store's atomic
//! adjustment operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::UserId;

/// A user's spendable credit balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    /// The owning user.
    pub user_id: UserId,

    /// Current credit count. Never negative.
    pub credits: i64,

    /// When the balance was last written.
    pub updated_at: DateTime<Utc>,

    /// When the last periodic grant was applied, if ever.
    pub last_grant_at: Option<DateTime<Utc>>,
}

impl AccountBalance {
    /// Create an empty balance for a user.
    #[must_use]
    pub fn new(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            credits: 0,
            updated_at: now,
            last_grant_at: None,
        }
    }

    /// Check whether the balance covers `amount`.
    #[must_use]
    pub fn can_afford(&self, amount: Amount) -> bool {
        self.credits >= amount.get()
    }

    /// Apply a deduction if it fits, returning the outcome.
    ///
    /// The balance is left untouched when the deduction does not fit.
    pub fn try_deduct(&mut self, amount: Amount, now: DateTime<Utc>) -> DeductOutcome {
        if !self.can_afford(amount) {
            return DeductOutcome::Insufficient {
                available: self.credits,
                required: amount.get(),
            };
        }
        self.credits -= amount.get();
        self.updated_at = now;
        DeductOutcome::Applied {
            balance: self.credits,
        }
    }

    /// Add credits. The balance is left untouched when the sum would
    /// overflow.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::BalanceOverflow`] if the new balance exceeds
    /// `i64::MAX`.
    pub fn credit(&mut self, amount: Amount, now: DateTime<Utc>) -> Result<i64, LedgerError> {
        self.credits = self
            .credits
            .checked_add(amount.get())
            .ok_or(LedgerError::BalanceOverflow {
                amount: amount.get(),
            })?;
        self.updated_at = now;
        Ok(self.credits)
    }
}

/// A strictly positive credit amount.
///
/// Constructing one is the single place `InvalidAmount` is raised, so every
/// store operation can assume its input is already valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Amount(i64);

impl Amount {
    /// Validate a raw amount.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidAmount`] if `amount <= 0`.
    pub fn new(amount: i64) -> Result<Self, LedgerError> {
        if amount > 0 {
            Ok(Self(amount))
        } else {
            Err(LedgerError::InvalidAmount { amount })
        }
    }

    /// Return the raw value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for Amount {
    type Error = LedgerError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for i64 {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a deduction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum DeductOutcome {
    /// The deduction was applied.
    Applied {
        /// Balance after the deduction.
        balance: i64,
    },

    /// The balance did not cover the amount; nothing was written.
    Insufficient {
        /// Balance at the time of the attempt (0 for unknown users).
        available: i64,
        /// Amount that was requested.
        required: i64,
    },
}

impl DeductOutcome {
    /// The new balance, if the deduction was applied.
    #[must_use]
    pub const fn balance(&self) -> Option<i64> {
        match self {
            Self::Applied { balance } => Some(*balance),
            Self::Insufficient { .. } => None,
        }
    }

    /// Whether the deduction was applied.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}
