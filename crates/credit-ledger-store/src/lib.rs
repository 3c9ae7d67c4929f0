//! Storage layer for the credit ledger.
//!
//! This crate provides the [`Store`] trait and its backends:
//!
//! - [`MemoryStore`]: a single async mutex over in-process maps. Used by tests
//!   and single-instance development deployments.
//! - [`PgStore`]: PostgreSQL via `sqlx`. Balance changes are single conditional
//!   statements (`UPDATE ... WHERE credits >= $amount`), so the guarantees hold
//!   across any number of service instances. The schema is managed with
//!   versioned migrations.
//! - `RocksStore` (feature `rocksdb-backend`): embedded `RocksDB` with column
//!   families and CBOR values.
//!
//! # Guarantees
//!
//! Every backend applies each operation atomically with respect to concurrent
//! callers on the same user: the balance never goes negative, two deductions
//! can never both spend the same credits, and a grant is applied at most once
//! per period. Each successful mutation writes exactly one
//! [`LedgerTransaction`] in the same atomic unit as the balance.
//!
//! # Example
//!
//! ```no_run
//! use credit_ledger_core::{Amount, LedgerAction, UserId};
//! use credit_ledger_store::{MemoryStore, Store};
//!
//! # async fn example() -> credit_ledger_store::Result<()> {
//! let store = MemoryStore::new();
//! let user_id = UserId::new("u1").unwrap();
//!
//! let amount = Amount::new(50_000).unwrap();
//! store.add(&user_id, amount, LedgerAction::Add, "purchase").await?;
//! let outcome = store.deduct(&user_id, Amount::new(1).unwrap(), "chat turn").await?;
//! assert_eq!(outcome.balance(), Some(49_999));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
pub mod postgres;

#[cfg(feature = "rocksdb-backend")]
pub mod keys;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
#[cfg(feature = "rocksdb-backend")]
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use credit_ledger_core::{
    AccountBalance, Amount, BillingStatus, DeductOutcome, GrantOutcome, GrantRequest,
    LedgerAction, LedgerTransaction, PlanCatalog, PlanDescriptor, PlanId, UserId,
};

/// The storage trait defining all ledger persistence operations.
///
/// This trait abstracts the storage layer so the service can run against
/// PostgreSQL, `RocksDB`, or memory without changing the ledger logic.
#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // Balance Operations
    // =========================================================================

    /// Get a user's balance row, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_balance(&self, user_id: &UserId) -> Result<Option<AccountBalance>>;

    /// Atomically add credits, creating the row if needed.
    ///
    /// `action` is recorded on the transaction and should be
    /// [`LedgerAction::Add`] or [`LedgerAction::Refund`].
    ///
    /// Returns the new balance.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn add(
        &self,
        user_id: &UserId,
        amount: Amount,
        action: LedgerAction,
        reason: &str,
    ) -> Result<i64>;

    /// Atomically deduct credits if the balance covers them.
    ///
    /// Never creates a row: an unknown user is reported as insufficient with
    /// zero available.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails. An insufficient
    /// balance is not an error.
    async fn deduct(&self, user_id: &UserId, amount: Amount, reason: &str)
        -> Result<DeductOutcome>;

    /// Atomically reset the balance to `grant.credits` if a grant is due.
    ///
    /// The due check and the write happen under the same row lock, so two
    /// concurrent calls in one period produce at most one grant.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn grant_if_due(
        &self,
        user_id: &UserId,
        grant: &GrantRequest,
        now: DateTime<Utc>,
    ) -> Result<GrantOutcome>;

    // =========================================================================
    // Transaction Operations
    // =========================================================================

    /// List transactions for a user, ordered by time (newest first).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerTransaction>>;

    // =========================================================================
    // Plan Catalog Operations
    // =========================================================================

    /// Get a plan by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_plan(&self, plan_id: &PlanId) -> Result<Option<PlanDescriptor>>;

    /// Insert or replace a plan. Returns the new catalog version.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn put_plan(&self, plan: &PlanDescriptor) -> Result<u64>;

    /// Read the whole catalog with its version.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn catalog(&self) -> Result<PlanCatalog>;

    /// Seed the catalog if it holds no plans. Returns whether seeding happened.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn seed_catalog(&self, catalog: &PlanCatalog) -> Result<bool>;

    // =========================================================================
    // Billing Status Operations
    // =========================================================================

    /// Get a user's billing status.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_billing_status(&self, user_id: &UserId) -> Result<Option<BillingStatus>>;

    /// Insert or replace a user's billing status.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn put_billing_status(&self, status: &BillingStatus) -> Result<()>;

    // =========================================================================
    // External Event Operations (webhook idempotency)
    // =========================================================================

    /// Record a provider event id. Returns `true` the first time an id is seen.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn record_external_event(&self, event_id: &str, event_type: &str) -> Result<bool>;

    /// Forget a provider event id so a redelivery is processed again.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn release_external_event(&self, event_id: &str) -> Result<()>;
}
