//! Core types and utilities for the credit ledger.
//!
//! This crate provides the foundational types used throughout the ledger:
//!
//! - **Identifiers**: `UserId`, `PlanId`, `TransactionId`
//! - **Balances**: `AccountBalance`, `Amount`
//! - **Plans**: `PlanDescriptor`, `PlanCatalog`
//! - **Billing**: `BillingStatus`, `SubscriptionStatus`
//! - **Transactions**: `LedgerTransaction`, `LedgerAction`
//! - **Grants**: `GrantPeriod`, `GrantRequest`, `GrantOutcome`
//!
//! # Credits
//!
//! Credits are whole units stored as `i64`. A balance is never negative: a
//! deduction that would overdraw the account is rejected without writing
//! anything and reported as [`DeductOutcome::Insufficient`], which is a normal
//! result rather than an error.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod balance;
pub mod billing;
pub mod error;
pub mod grant;
pub mod ids;
pub mod plan;
pub mod transaction;

pub use balance::{AccountBalance, Amount, DeductOutcome};
pub use billing::{BillingStatus, SubscriptionStatus};
pub use error::{LedgerError, Result};
pub use grant::{GrantOutcome, GrantPeriod, GrantRequest};
pub use ids::{IdError, PlanId, TransactionId, UserId};
pub use plan::{PlanCatalog, PlanDescriptor, DEFAULT_PLANS, GRANT_DAYS_PER_MONTH};
pub use transaction::{LedgerAction, LedgerTransaction};
