//! In-memory storage implementation.
//!
//! All state sits behind one async mutex, which makes every operation
//! linearizable within the process. It does not coordinate across processes;
//! multi-instance deployments use [`crate::PgStore`].

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use credit_ledger_core::{
    AccountBalance, Amount, BillingStatus, DeductOutcome, GrantOutcome, GrantRequest,
    LedgerAction, LedgerTransaction, PlanCatalog, PlanDescriptor, PlanId, UserId,
};

use crate::error::{Result, StoreError};
use crate::Store;

#[derive(Default)]
struct Inner {
    balances: HashMap<UserId, AccountBalance>,
    transactions: HashMap<UserId, Vec<LedgerTransaction>>,
    plans: BTreeMap<PlanId, PlanDescriptor>,
    catalog_version: u64,
    billing: HashMap<UserId, BillingStatus>,
    external_events: HashMap<String, String>,
}

impl Inner {
    fn append(&mut self, record: LedgerTransaction) {
        self.transactions
            .entry(record.user_id.clone())
            .or_default()
            .push(record);
    }
}

/// Memory-backed storage implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_balance(&self, user_id: &UserId) -> Result<Option<AccountBalance>> {
        Ok(self.inner.lock().await.balances.get(user_id).cloned())
    }

    async fn add(
        &self,
        user_id: &UserId,
        amount: Amount,
        action: LedgerAction,
        reason: &str,
    ) -> Result<i64> {
        debug_assert!(matches!(action, LedgerAction::Add | LedgerAction::Refund));
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        let balance = inner
            .balances
            .entry(user_id.clone())
            .or_insert_with(|| AccountBalance::new(user_id.clone(), now))
            .credit(amount, now)
            .map_err(StoreError::from_credit)?;

        inner.append(LedgerTransaction::new(
            user_id.clone(),
            action,
            amount.get(),
            reason,
            balance,
            now,
        ));

        Ok(balance)
    }

    async fn deduct(
        &self,
        user_id: &UserId,
        amount: Amount,
        reason: &str,
    ) -> Result<DeductOutcome> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        let Some(account) = inner.balances.get_mut(user_id) else {
            return Ok(DeductOutcome::Insufficient {
                available: 0,
                required: amount.get(),
            });
        };

        let outcome = account.try_deduct(amount, now);
        if let DeductOutcome::Applied { balance } = outcome {
            inner.append(LedgerTransaction::new(
                user_id.clone(),
                LedgerAction::Deduct,
                amount.get(),
                reason,
                balance,
                now,
            ));
        }

        Ok(outcome)
    }

    async fn grant_if_due(
        &self,
        user_id: &UserId,
        grant: &GrantRequest,
        now: DateTime<Utc>,
    ) -> Result<GrantOutcome> {
        let mut inner = self.inner.lock().await;

        let account = inner
            .balances
            .entry(user_id.clone())
            .or_insert_with(|| AccountBalance::new(user_id.clone(), now));

        if !grant.period.is_due(account.last_grant_at, now) {
            return Ok(GrantOutcome::not_granted(account.credits));
        }

        account.credits = grant.credits;
        account.last_grant_at = Some(now);
        account.updated_at = now;

        inner.append(LedgerTransaction::grant(
            user_id.clone(),
            &grant.plan_id,
            grant.credits,
            now,
        ));

        Ok(GrantOutcome::granted(grant.credits))
    }

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerTransaction>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transactions
            .get(user_id)
            .map(|txs| txs.iter().rev().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_plan(&self, plan_id: &PlanId) -> Result<Option<PlanDescriptor>> {
        Ok(self.inner.lock().await.plans.get(plan_id).cloned())
    }

    async fn put_plan(&self, plan: &PlanDescriptor) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        inner.plans.insert(plan.plan_id.clone(), plan.clone());
        inner.catalog_version += 1;
        Ok(inner.catalog_version)
    }

    async fn catalog(&self) -> Result<PlanCatalog> {
        let inner = self.inner.lock().await;
        Ok(PlanCatalog {
            version: inner.catalog_version,
            plans: inner.plans.clone(),
        })
    }

    async fn seed_catalog(&self, catalog: &PlanCatalog) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.plans.is_empty() {
            return Ok(false);
        }
        inner.plans.clone_from(&catalog.plans);
        inner.catalog_version = catalog.version.max(1);
        Ok(true)
    }

    async fn get_billing_status(&self, user_id: &UserId) -> Result<Option<BillingStatus>> {
        Ok(self.inner.lock().await.billing.get(user_id).cloned())
    }

    async fn put_billing_status(&self, status: &BillingStatus) -> Result<()> {
        self.inner
            .lock()
            .await
            .billing
            .insert(status.user_id.clone(), status.clone());
        Ok(())
    }

    async fn record_external_event(&self, event_id: &str, event_type: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.external_events.contains_key(event_id) {
            return Ok(false);
        }
        inner
            .external_events
            .insert(event_id.to_string(), event_type.to_string());
        Ok(true)
    }

    async fn release_external_event(&self, event_id: &str) -> Result<()> {
        self.inner.lock().await.external_events.remove(event_id);
        Ok(())
    }
}
