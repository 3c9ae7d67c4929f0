//! `RocksDB` storage implementation.
//!
//! `RocksDB` has no conditional writes, so every read-modify-write runs under
//! a process-wide write lock and lands in a single [`WriteBatch`]. Reads do not
//! take the lock. The database is single-process; it does not coordinate with
//! other service instances.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use tokio::sync::Mutex;

use credit_ledger_core::{
    AccountBalance, Amount, BillingStatus, DeductOutcome, GrantOutcome, GrantRequest,
    LedgerAction, LedgerTransaction, PlanCatalog, PlanDescriptor, PlanId, TransactionId, UserId,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf, CATALOG_VERSION_KEY};
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    write_lock: Mutex<()>,
}

fn db_err(e: rocksdb::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path.as_ref(), cf_descriptors)
            .map_err(db_err)?;
        tracing::debug!(path = %path.as_ref().display(), "opened RocksDB store");

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get_value<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(db_err)?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn read_balance(&self, user_id: &UserId) -> Result<Option<AccountBalance>> {
        self.get_value(cf::BALANCES, &keys::user_key(user_id))
    }

    fn read_catalog_version(&self) -> Result<u64> {
        let cf = self.cf(cf::META)?;
        let Some(raw) = self.db.get_cf(&cf, CATALOG_VERSION_KEY).map_err(db_err)? else {
            return Ok(0);
        };
        let bytes: [u8; 8] = raw
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Serialization("corrupt catalog version".to_string()))?;
        Ok(u64::from_be_bytes(bytes))
    }

    fn read_transaction(&self, id: &TransactionId) -> Result<Option<LedgerTransaction>> {
        self.get_value(cf::TRANSACTIONS, &keys::transaction_key(id))
    }

    /// Stage a balance row together with its transaction record.
    fn stage_mutation(
        &self,
        batch: &mut WriteBatch,
        account: &AccountBalance,
        record: &LedgerTransaction,
    ) -> Result<()> {
        let cf_balances = self.cf(cf::BALANCES)?;
        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        let cf_tx_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;

        batch.put_cf(&cf_balances, keys::user_key(&account.user_id), Self::serialize(account)?);
        batch.put_cf(&cf_tx, keys::transaction_key(&record.id), Self::serialize(record)?);
        batch.put_cf(
            &cf_tx_by_user,
            keys::user_transaction_key(&record.user_id, &record.id),
            [],
        );
        Ok(())
    }

    // The helpers below must be called with `write_lock` held.

    fn apply_add(
        &self,
        user_id: &UserId,
        amount: Amount,
        action: LedgerAction,
        reason: &str,
    ) -> Result<i64> {
        let now = Utc::now();
        let mut account = self
            .read_balance(user_id)?
            .unwrap_or_else(|| AccountBalance::new(user_id.clone(), now));
        let balance = account
            .credit(amount, now)
            .map_err(StoreError::from_credit)?;
        let record =
            LedgerTransaction::new(user_id.clone(), action, amount.get(), reason, balance, now);

        let mut batch = WriteBatch::default();
        self.stage_mutation(&mut batch, &account, &record)?;
        self.db.write(batch).map_err(db_err)?;

        Ok(balance)
    }

    fn apply_deduct(&self, user_id: &UserId, amount: Amount, reason: &str) -> Result<DeductOutcome> {
        let now = Utc::now();
        let Some(mut account) = self.read_balance(user_id)? else {
            return Ok(DeductOutcome::Insufficient {
                available: 0,
                required: amount.get(),
            });
        };

        let outcome = account.try_deduct(amount, now);
        if let DeductOutcome::Applied { balance } = outcome {
            let record = LedgerTransaction::new(
                user_id.clone(),
                LedgerAction::Deduct,
                amount.get(),
                reason,
                balance,
                now,
            );
            let mut batch = WriteBatch::default();
            self.stage_mutation(&mut batch, &account, &record)?;
            self.db.write(batch).map_err(db_err)?;
        }

        Ok(outcome)
    }

    fn apply_grant(
        &self,
        user_id: &UserId,
        grant: &GrantRequest,
        now: DateTime<Utc>,
    ) -> Result<GrantOutcome> {
        let mut account = self
            .read_balance(user_id)?
            .unwrap_or_else(|| AccountBalance::new(user_id.clone(), now));

        if !grant.period.is_due(account.last_grant_at, now) {
            return Ok(GrantOutcome::not_granted(account.credits));
        }

        account.credits = grant.credits;
        account.last_grant_at = Some(now);
        account.updated_at = now;
        let record = LedgerTransaction::grant(user_id.clone(), &grant.plan_id, grant.credits, now);

        let mut batch = WriteBatch::default();
        self.stage_mutation(&mut batch, &account, &record)?;
        self.db.write(batch).map_err(db_err)?;

        Ok(GrantOutcome::granted(grant.credits))
    }

    fn apply_put_plan(&self, plan: &PlanDescriptor) -> Result<u64> {
        let cf_plans = self.cf(cf::PLANS)?;
        let cf_meta = self.cf(cf::META)?;
        let version = self.read_catalog_version()? + 1;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_plans, plan.plan_id.as_bytes(), Self::serialize(plan)?);
        batch.put_cf(&cf_meta, CATALOG_VERSION_KEY, version.to_be_bytes());
        self.db.write(batch).map_err(db_err)?;

        Ok(version)
    }

    fn apply_seed(&self, catalog: &PlanCatalog) -> Result<bool> {
        let cf_plans = self.cf(cf::PLANS)?;
        if self.db.iterator_cf(&cf_plans, IteratorMode::Start).next().is_some() {
            return Ok(false);
        }

        let cf_meta = self.cf(cf::META)?;
        let mut batch = WriteBatch::default();
        for plan in catalog.iter() {
            batch.put_cf(&cf_plans, plan.plan_id.as_bytes(), Self::serialize(plan)?);
        }
        batch.put_cf(&cf_meta, CATALOG_VERSION_KEY, catalog.version.max(1).to_be_bytes());
        self.db.write(batch).map_err(db_err)?;

        Ok(true)
    }

    fn read_catalog(&self) -> Result<PlanCatalog> {
        let cf_plans = self.cf(cf::PLANS)?;
        let mut catalog = PlanCatalog::empty();

        for item in self.db.iterator_cf(&cf_plans, IteratorMode::Start) {
            let (_, value) = item.map_err(db_err)?;
            let plan: PlanDescriptor = Self::deserialize(&value)?;
            catalog.plans.insert(plan.plan_id.clone(), plan);
        }
        catalog.version = self.read_catalog_version()?;

        Ok(catalog)
    }

    fn read_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerTransaction>> {
        let cf_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;
        let prefix = keys::user_transactions_prefix(user_id);

        // Seek to the end of this user's range and walk backwards so the
        // newest transactions come first.
        let mut upper = prefix.clone();
        upper.extend_from_slice(&[0xFF; 16]);
        let iter = self
            .db
            .iterator_cf(&cf_by_user, IteratorMode::From(&upper, Direction::Reverse));

        let mut transactions = Vec::new();
        let mut skipped = 0;
        for item in iter {
            let (key, _) = item.map_err(db_err)?;
            if !key.starts_with(&prefix) {
                break;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            if transactions.len() >= limit {
                break;
            }

            let Some(tx_id) = keys::extract_transaction_id_from_user_key(&key) else {
                continue;
            };
            if let Some(tx) = self.read_transaction(&tx_id)? {
                transactions.push(tx);
            }
        }

        Ok(transactions)
    }

    fn apply_record_event(&self, event_id: &str, event_type: &str) -> Result<bool> {
        let cf = self.cf(cf::EXTERNAL_EVENTS)?;
        if self.db.get_cf(&cf, event_id.as_bytes()).map_err(db_err)?.is_some() {
            return Ok(false);
        }
        self.db
            .put_cf(&cf, event_id.as_bytes(), event_type.as_bytes())
            .map_err(db_err)?;
        Ok(true)
    }
}

#[async_trait]
impl Store for RocksStore {
    async fn get_balance(&self, user_id: &UserId) -> Result<Option<AccountBalance>> {
        self.read_balance(user_id)
    }

    async fn add(
        &self,
        user_id: &UserId,
        amount: Amount,
        action: LedgerAction,
        reason: &str,
    ) -> Result<i64> {
        let _guard = self.write_lock.lock().await;
        self.apply_add(user_id, amount, action, reason)
    }

    async fn deduct(
        &self,
        user_id: &UserId,
        amount: Amount,
        reason: &str,
    ) -> Result<DeductOutcome> {
        let _guard = self.write_lock.lock().await;
        self.apply_deduct(user_id, amount, reason)
    }

    async fn grant_if_due(
        &self,
        user_id: &UserId,
        grant: &GrantRequest,
        now: DateTime<Utc>,
    ) -> Result<GrantOutcome> {
        let _guard = self.write_lock.lock().await;
        self.apply_grant(user_id, grant, now)
    }

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerTransaction>> {
        self.read_transactions(user_id, limit, offset)
    }

    async fn get_plan(&self, plan_id: &PlanId) -> Result<Option<PlanDescriptor>> {
        self.get_value(cf::PLANS, plan_id.as_bytes())
    }

    async fn put_plan(&self, plan: &PlanDescriptor) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        self.apply_put_plan(plan)
    }

    async fn catalog(&self) -> Result<PlanCatalog> {
        self.read_catalog()
    }

    async fn seed_catalog(&self, catalog: &PlanCatalog) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        self.apply_seed(catalog)
    }

    async fn get_billing_status(&self, user_id: &UserId) -> Result<Option<BillingStatus>> {
        self.get_value(cf::BILLING, &keys::user_key(user_id))
    }

    async fn put_billing_status(&self, status: &BillingStatus) -> Result<()> {
        let cf = self.cf(cf::BILLING)?;
        self.db
            .put_cf(&cf, keys::user_key(&status.user_id), Self::serialize(status)?)
            .map_err(db_err)
    }

    async fn record_external_event(&self, event_id: &str, event_type: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        self.apply_record_event(event_id, event_type)
    }

    async fn release_external_event(&self, event_id: &str) -> Result<()> {
        let cf = self.cf(cf::EXTERNAL_EVENTS)?;
        self.db.delete_cf(&cf, event_id.as_bytes()).map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use credit_ledger_core::{GrantPeriod, SubscriptionStatus};
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn amount(n: i64) -> Amount {
        Amount::new(n).unwrap()
    }

    #[tokio::test]
    async fn add_and_deduct_with_transactions() {
        let (store, _dir) = create_test_store();
        let u = user("u1");

        assert_eq!(
            store.add(&u, amount(5_000), LedgerAction::Add, "purchase").await.unwrap(),
            5_000
        );
        let outcome = store.deduct(&u, amount(100), "chat").await.unwrap();
        assert_eq!(outcome, DeductOutcome::Applied { balance: 4_900 });

        let account = store.get_balance(&u).await.unwrap().unwrap();
        assert_eq!(account.credits, 4_900);

        let transactions = store.list_transactions(&u, 10, 0).await.unwrap();
        assert_eq!(transactions.len(), 2);
        assert_eq!(transactions[0].action, LedgerAction::Deduct);
        assert_eq!(transactions[1].action, LedgerAction::Add);
    }

    #[tokio::test]
    async fn add_overflow_leaves_row_untouched() {
        let (store, _dir) = create_test_store();
        let u = user("u1");
        store.add(&u, amount(i64::MAX), LedgerAction::Add, "seed").await.unwrap();

        let err = store.add(&u, amount(1), LedgerAction::Refund, "refund").await.unwrap_err();
        assert!(matches!(err, StoreError::BalanceOverflow { amount: 1 }));
        assert_eq!(store.get_balance(&u).await.unwrap().unwrap().credits, i64::MAX);
        assert_eq!(store.list_transactions(&u, 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn insufficient_deduct_leaves_state_untouched() {
        let (store, _dir) = create_test_store();
        let u = user("u1");
        store.add(&u, amount(5), LedgerAction::Add, "seed").await.unwrap();

        let outcome = store.deduct(&u, amount(100), "too much").await.unwrap();
        assert_eq!(
            outcome,
            DeductOutcome::Insufficient {
                available: 5,
                required: 100
            }
        );
        assert_eq!(store.get_balance(&u).await.unwrap().unwrap().credits, 5);
        assert_eq!(store.list_transactions(&u, 10, 0).await.unwrap().len(), 1);

        let ghost = store.deduct(&user("ghost"), amount(1), "chat").await.unwrap();
        assert!(!ghost.is_applied());
        assert!(store.get_balance(&user("ghost")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transactions_paginate_and_stay_per_user() {
        let (store, _dir) = create_test_store();
        let u1 = user("u1");
        let u10 = user("u10");

        store.add(&u1, amount(1), LedgerAction::Add, "first").await.unwrap();
        store.add(&u10, amount(1), LedgerAction::Add, "other user").await.unwrap();
        store.add(&u1, amount(1), LedgerAction::Refund, "second").await.unwrap();

        let page1 = store.list_transactions(&u1, 1, 0).await.unwrap();
        let page2 = store.list_transactions(&u1, 1, 1).await.unwrap();
        let page3 = store.list_transactions(&u1, 1, 2).await.unwrap();
        assert_eq!(page1[0].reason, "second");
        assert_eq!(page2[0].reason, "first");
        assert!(page3.is_empty());
    }

    #[tokio::test]
    async fn grant_applies_once_per_day() {
        let (store, _dir) = create_test_store();
        let u = user("u1");
        let grant = GrantRequest {
            plan_id: PlanId::new("one_t").unwrap(),
            credits: 400,
            period: GrantPeriod::Daily,
        };
        let now = Utc.with_ymd_and_hms(2026, 3, 5, 12, 0, 0).unwrap();

        assert!(store.grant_if_due(&u, &grant, now).await.unwrap().granted);
        let again = store
            .grant_if_due(&u, &grant, now + chrono::Duration::hours(23))
            .await
            .unwrap();
        assert_eq!(again, GrantOutcome::not_granted(400));
        let next_day = store
            .grant_if_due(&u, &grant, now + chrono::Duration::hours(24))
            .await
            .unwrap();
        assert!(next_day.granted);
    }

    #[tokio::test]
    async fn catalog_seed_and_versioning() {
        let (store, _dir) = create_test_store();
        assert_eq!(store.catalog().await.unwrap().version, 0);

        assert!(store.seed_catalog(&PlanCatalog::default()).await.unwrap());
        assert!(!store.seed_catalog(&PlanCatalog::default()).await.unwrap());
        assert_eq!(store.catalog().await.unwrap(), PlanCatalog::default());

        let plan = PlanDescriptor::new(PlanId::new("one_max").unwrap(), 300_000).unwrap();
        assert_eq!(store.put_plan(&plan).await.unwrap(), 2);
        assert_eq!(store.get_plan(&plan.plan_id).await.unwrap(), Some(plan));
    }

    #[tokio::test]
    async fn billing_status_and_events_persist_across_reopen() {
        let dir = TempDir::new().unwrap();
        let u = user("u1");
        {
            let store = RocksStore::open(dir.path()).unwrap();
            let status = BillingStatus::new(
                u.clone(),
                Some(PlanId::new("one_z").unwrap()),
                SubscriptionStatus::Active,
            );
            store.put_billing_status(&status).await.unwrap();
            assert!(store.record_external_event("evt_1", "payment.captured").await.unwrap());
        }

        let store = RocksStore::open(dir.path()).unwrap();
        let status = store.get_billing_status(&u).await.unwrap().unwrap();
        assert_eq!(status.status, SubscriptionStatus::Active);
        assert!(!store.record_external_event("evt_1", "payment.captured").await.unwrap());

        store.release_external_event("evt_1").await.unwrap();
        assert!(store.record_external_event("evt_1", "payment.captured").await.unwrap());
    }
}
