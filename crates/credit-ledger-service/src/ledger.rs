//! The ledger facade used by handlers and embedding callers.
//!
//! [`Ledger`] owns the store handle and adds what the store does not know
//! about: the grant policy (billing status and plan lookups), a timeout on
//! every store round-trip, and the reserve-then-refund [`Ledger::charge`]
//! flow for billable work.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use credit_ledger_core::{
    Amount, BillingStatus, DeductOutcome, GrantOutcome, GrantPeriod, GrantRequest, LedgerAction,
    LedgerError, LedgerTransaction, PlanCatalog, PlanDescriptor, PlanId, Result, UserId,
};
use credit_ledger_store::Store;

/// Result of [`Ledger::charge`].
#[derive(Debug)]
pub enum ChargeOutcome<T, E> {
    /// Credits were deducted and the work succeeded.
    Completed {
        /// What the work returned.
        output: T,
        /// Balance after the deduction.
        balance: i64,
    },

    /// The balance did not cover the cost. The work was not run.
    Insufficient {
        /// Balance at the time of the attempt.
        available: i64,
        /// Cost of the work.
        required: i64,
    },

    /// The work failed after the deduction.
    Failed {
        /// The work's error.
        error: E,
        /// Whether the deducted credits were returned. `false` means the
        /// refund itself failed and needs manual reconciliation.
        refunded: bool,
    },
}

/// Ledger operations with timeouts and grant policy applied.
pub struct Ledger {
    store: Arc<dyn Store>,
    grant_period: GrantPeriod,
    store_timeout: Duration,
}

impl Ledger {
    /// Create a ledger over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, grant_period: GrantPeriod, store_timeout: Duration) -> Self {
        Self {
            store,
            grant_period,
            store_timeout,
        }
    }

    /// The configured grant period.
    #[must_use]
    pub const fn grant_period(&self) -> GrantPeriod {
        self.grant_period
    }

    /// Run one store call under the store timeout.
    ///
    /// An elapsed timeout is reported as [`LedgerError::StoreUnavailable`]:
    /// the caller cannot know whether the write landed.
    async fn call<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = credit_ledger_store::Result<T>>,
    {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result.map_err(LedgerError::from),
            Err(_) => {
                tracing::warn!(
                    op,
                    timeout_ms = %self.store_timeout.as_millis(),
                    "Store call timed out"
                );
                Err(LedgerError::StoreUnavailable(format!(
                    "{op} timed out after {}ms",
                    self.store_timeout.as_millis()
                )))
            }
        }
    }

    // =========================================================================
    // Balance operations
    // =========================================================================

    /// Current balance. Unknown users have a balance of 0.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::StoreUnavailable`] on timeout or a storage error.
    pub async fn get_balance(&self, user_id: &UserId) -> Result<i64> {
        let account = self
            .call("get_balance", self.store.get_balance(user_id))
            .await?;
        Ok(account.map_or(0, |a| a.credits))
    }

    /// Deduct `amount` if the balance covers it.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure failures. An insufficient
    /// balance is [`DeductOutcome::Insufficient`].
    pub async fn deduct(
        &self,
        user_id: &UserId,
        amount: Amount,
        reason: &str,
    ) -> Result<DeductOutcome> {
        let outcome = self
            .call("deduct", self.store.deduct(user_id, amount, reason))
            .await?;

        match outcome {
            DeductOutcome::Applied { balance } => {
                tracing::debug!(user_id = %user_id, amount = amount.get(), balance, reason, "Deducted credits");
            }
            DeductOutcome::Insufficient {
                available,
                required,
            } => {
                tracing::info!(user_id = %user_id, available, required, reason, "Insufficient credits");
            }
        }

        Ok(outcome)
    }

    /// Add `amount`, creating the balance row if needed. Returns the new balance.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::StoreUnavailable`] on timeout or a storage error.
    pub async fn add(&self, user_id: &UserId, amount: Amount, reason: &str) -> Result<i64> {
        let balance = self
            .call(
                "add",
                self.store.add(user_id, amount, LedgerAction::Add, reason),
            )
            .await?;
        tracing::debug!(user_id = %user_id, amount = amount.get(), balance, reason, "Added credits");
        Ok(balance)
    }

    /// Return `amount` after failed billable work. Recorded as a refund.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::StoreUnavailable`] on timeout or a storage error.
    /// After a timeout the refund may or may not have landed; re-read the
    /// balance or the transaction history before retrying.
    pub async fn refund(&self, user_id: &UserId, amount: Amount, reason: &str) -> Result<i64> {
        let balance = self
            .call(
                "refund",
                self.store.add(user_id, amount, LedgerAction::Refund, reason),
            )
            .await?;
        tracing::warn!(user_id = %user_id, amount = amount.get(), balance, reason, "Refunded credits");
        Ok(balance)
    }

    /// Grant the plan entitlement if the user is entitled and a grant is due.
    ///
    /// No-op (`granted: false`) when the user has no entitled billing status,
    /// when that status is for a different plan, or when `plan_id` is not in
    /// the catalog. When due, the balance is reset to
    /// the plan's monthly credits.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::StoreUnavailable`] on timeout or a storage error.
    pub async fn grant_if_due(
        &self,
        user_id: &UserId,
        plan_id: &PlanId,
        now: DateTime<Utc>,
    ) -> Result<GrantOutcome> {
        let status = self
            .call("get_billing_status", self.store.get_billing_status(user_id))
            .await?;
        let Some(status) = status.filter(BillingStatus::is_entitled) else {
            tracing::debug!(user_id = %user_id, "Grant skipped: not entitled");
            return Ok(GrantOutcome::not_granted(self.get_balance(user_id).await?));
        };
        if status.plan_id.as_ref() != Some(plan_id) {
            tracing::debug!(
                user_id = %user_id,
                plan_id = %plan_id,
                subscribed = ?status.plan_id,
                "Grant skipped: plan does not match subscription"
            );
            return Ok(GrantOutcome::not_granted(self.get_balance(user_id).await?));
        }

        let Some(plan) = self
            .call("get_plan", self.store.get_plan(plan_id))
            .await?
        else {
            tracing::warn!(user_id = %user_id, plan_id = %plan_id, "Grant skipped: unknown plan");
            return Ok(GrantOutcome::not_granted(self.get_balance(user_id).await?));
        };

        let request = GrantRequest {
            plan_id: plan.plan_id,
            credits: plan.monthly_credits,
            period: self.grant_period,
        };
        let outcome = self
            .call(
                "grant_if_due",
                self.store.grant_if_due(user_id, &request, now),
            )
            .await?;

        if outcome.granted {
            tracing::info!(
                user_id = %user_id,
                plan_id = %request.plan_id,
                balance = outcome.balance,
                period = self.grant_period.as_str(),
                "Granted plan credits"
            );
        }
        Ok(outcome)
    }

    /// Deduct `amount`, run `work`, and refund automatically if it fails.
    ///
    /// A crash between the deduction and the refund leaks the credits; the
    /// deduction's transaction record is what reconciliation starts from.
    ///
    /// # Errors
    ///
    /// Returns an error if the deduction itself fails. Work and refund
    /// failures are reported through [`ChargeOutcome::Failed`].
    pub async fn charge<T, E, F, Fut>(
        &self,
        user_id: &UserId,
        amount: Amount,
        reason: &str,
        work: F,
    ) -> Result<ChargeOutcome<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let balance = match self.deduct(user_id, amount, reason).await? {
            DeductOutcome::Applied { balance } => balance,
            DeductOutcome::Insufficient {
                available,
                required,
            } => {
                return Ok(ChargeOutcome::Insufficient {
                    available,
                    required,
                })
            }
        };

        match work().await {
            Ok(output) => Ok(ChargeOutcome::Completed { output, balance }),
            Err(error) => {
                tracing::warn!(user_id = %user_id, amount = amount.get(), reason, error = %error, "Billable work failed, refunding");
                let refund_reason = format!("refund: {reason}");
                let refunded = match self.refund(user_id, amount, &refund_reason).await {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::error!(
                            user_id = %user_id,
                            amount = amount.get(),
                            reason,
                            error = %e,
                            "Refund failed; credits need manual reconciliation"
                        );
                        false
                    }
                };
                Ok(ChargeOutcome::Failed { error, refunded })
            }
        }
    }

    /// Transaction history, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::StoreUnavailable`] on timeout or a storage error.
    pub async fn transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerTransaction>> {
        self.call(
            "list_transactions",
            self.store.list_transactions(user_id, limit, offset),
        )
        .await
    }

    // =========================================================================
    // Plan catalog and billing status
    // =========================================================================

    /// Look up a plan.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::PlanNotFound`] for an unknown plan.
    pub async fn get_plan(&self, plan_id: &PlanId) -> Result<PlanDescriptor> {
        self.call("get_plan", self.store.get_plan(plan_id))
            .await?
            .ok_or_else(|| LedgerError::PlanNotFound {
                plan_id: plan_id.to_string(),
            })
    }

    /// The whole plan catalog with its version.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::StoreUnavailable`] on timeout or a storage error.
    pub async fn catalog(&self) -> Result<PlanCatalog> {
        self.call("catalog", self.store.catalog()).await
    }

    /// Insert or replace a plan. Returns the new catalog version.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::StoreUnavailable`] on timeout or a storage error.
    pub async fn put_plan(&self, plan: &PlanDescriptor) -> Result<u64> {
        let version = self.call("put_plan", self.store.put_plan(plan)).await?;
        tracing::info!(
            plan_id = %plan.plan_id,
            monthly_credits = plan.monthly_credits,
            version,
            "Plan updated"
        );
        Ok(version)
    }

    /// Seed the catalog if the store holds no plans.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::StoreUnavailable`] on timeout or a storage error.
    pub async fn seed_catalog(&self, catalog: &PlanCatalog) -> Result<bool> {
        self.call("seed_catalog", self.store.seed_catalog(catalog))
            .await
    }

    /// A user's billing status.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::StoreUnavailable`] on timeout or a storage error.
    pub async fn billing_status(&self, user_id: &UserId) -> Result<Option<BillingStatus>> {
        self.call("get_billing_status", self.store.get_billing_status(user_id))
            .await
    }

    /// Replace a user's billing status.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::StoreUnavailable`] on timeout or a storage error.
    pub async fn set_billing_status(&self, status: &BillingStatus) -> Result<()> {
        self.call("put_billing_status", self.store.put_billing_status(status))
            .await?;
        tracing::info!(
            user_id = %status.user_id,
            plan_id = ?status.plan_id,
            status = status.status.as_str(),
            "Billing status updated"
        );
        Ok(())
    }

    // =========================================================================
    // External events
    // =========================================================================

    /// Claim a provider event id. Returns `false` if it was already processed.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::StoreUnavailable`] on timeout or a storage error.
    pub async fn claim_event(&self, event_id: &str, event_type: &str) -> Result<bool> {
        self.call(
            "record_external_event",
            self.store.record_external_event(event_id, event_type),
        )
        .await
    }

    /// Release a claimed event id so a redelivery is processed again.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::StoreUnavailable`] on timeout or a storage error.
    pub async fn release_event(&self, event_id: &str) -> Result<()> {
        self.call(
            "release_external_event",
            self.store.release_external_event(event_id),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use credit_ledger_core::{AccountBalance, SubscriptionStatus};
    use credit_ledger_store::MemoryStore;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn amount(n: i64) -> Amount {
        Amount::new(n).unwrap()
    }

    fn plan(id: &str) -> PlanId {
        PlanId::new(id).unwrap()
    }

    async fn ledger() -> Ledger {
        let store = Arc::new(MemoryStore::new());
        store.seed_catalog(&PlanCatalog::default()).await.unwrap();
        Ledger::new(store, GrantPeriod::Monthly, Duration::from_secs(3))
    }

    async fn subscribe(ledger: &Ledger, u: &UserId, plan_id: &str, status: SubscriptionStatus) {
        let status = BillingStatus::new(u.clone(), Some(plan(plan_id)), status);
        ledger.set_billing_status(&status).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_user_defaults_and_add_creates_row() {
        let ledger = ledger().await;
        let u = user("u1");

        assert_eq!(ledger.get_balance(&u).await.unwrap(), 0);
        assert_eq!(ledger.add(&u, amount(50_000), "purchase").await.unwrap(), 50_000);
        assert_eq!(ledger.get_balance(&u).await.unwrap(), 50_000);
    }

    #[tokio::test]
    async fn deduct_never_goes_negative() {
        let ledger = ledger().await;
        let u = user("u1");

        let outcome = ledger.deduct(&u, amount(1), "chat").await.unwrap();
        assert_eq!(
            outcome,
            DeductOutcome::Insufficient {
                available: 0,
                required: 1
            }
        );

        ledger.add(&u, amount(50_000), "purchase").await.unwrap();
        let outcome = ledger.deduct(&u, amount(1), "chat").await.unwrap();
        assert_eq!(outcome, DeductOutcome::Applied { balance: 49_999 });

        let outcome = ledger.deduct(&u, amount(50_000), "video").await.unwrap();
        assert!(!outcome.is_applied());
        assert_eq!(ledger.get_balance(&u).await.unwrap(), 49_999);
    }

    #[tokio::test]
    async fn refund_restores_pre_deduct_balance() {
        let ledger = ledger().await;
        let u = user("u1");
        ledger.add(&u, amount(700), "purchase").await.unwrap();

        ledger.deduct(&u, amount(250), "image").await.unwrap();
        ledger.refund(&u, amount(250), "image failed").await.unwrap();

        assert_eq!(ledger.get_balance(&u).await.unwrap(), 700);
        let txs = ledger.transactions(&u, 10, 0).await.unwrap();
        assert_eq!(txs[0].action, LedgerAction::Refund);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_deducts_exactly_one_wins() {
        let ledger = Arc::new(ledger().await);
        let u = user("u1");
        ledger.add(&u, amount(50_000), "purchase").await.unwrap();

        let a = {
            let (ledger, u) = (Arc::clone(&ledger), u.clone());
            tokio::spawn(async move { ledger.deduct(&u, amount(30_000), "a").await.unwrap() })
        };
        let b = {
            let (ledger, u) = (Arc::clone(&ledger), u.clone());
            tokio::spawn(async move { ledger.deduct(&u, amount(30_000), "b").await.unwrap() })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(
            [a, b].iter().filter(|outcome| outcome.is_applied()).count(),
            1
        );
        assert!([a, b].contains(&DeductOutcome::Applied { balance: 20_000 }));
        assert_eq!(ledger.get_balance(&u).await.unwrap(), 20_000);
    }

    #[tokio::test]
    async fn grant_applies_once_per_period() {
        let ledger = ledger().await;
        let u = user("u1");
        subscribe(&ledger, &u, "one_z", SubscriptionStatus::Active).await;
        let now = Utc.with_ymd_and_hms(2026, 5, 10, 9, 0, 0).unwrap();

        let first = ledger.grant_if_due(&u, &plan("one_z"), now).await.unwrap();
        assert_eq!(first, GrantOutcome::granted(50_000));

        let again = ledger.grant_if_due(&u, &plan("one_z"), now).await.unwrap();
        assert_eq!(again, GrantOutcome::not_granted(50_000));

        let next_month = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        ledger.deduct(&u, amount(10), "chat").await.unwrap();
        let renewed = ledger.grant_if_due(&u, &plan("one_z"), next_month).await.unwrap();
        assert_eq!(renewed, GrantOutcome::granted(50_000));
    }

    #[tokio::test]
    async fn grant_requires_entitlement_and_known_plan() {
        let ledger = ledger().await;
        let u = user("u1");
        let now = Utc::now();

        let none = ledger.grant_if_due(&u, &plan("one_z"), now).await.unwrap();
        assert!(!none.granted);

        subscribe(&ledger, &u, "one_z", SubscriptionStatus::Cancelled).await;
        let cancelled = ledger.grant_if_due(&u, &plan("one_z"), now).await.unwrap();
        assert!(!cancelled.granted);

        subscribe(&ledger, &u, "one_gone", SubscriptionStatus::Active).await;
        let unknown = ledger.grant_if_due(&u, &plan("one_gone"), now).await.unwrap();
        assert!(!unknown.granted);

        subscribe(&ledger, &u, "one_z", SubscriptionStatus::Trialing).await;
        let mismatched = ledger.grant_if_due(&u, &plan("one_t"), now).await.unwrap();
        assert_eq!(mismatched, GrantOutcome::not_granted(0));

        let trialing = ledger.grant_if_due(&u, &plan("one_z"), now).await.unwrap();
        assert_eq!(trialing, GrantOutcome::granted(50_000));
    }

    #[tokio::test]
    async fn charge_completes_and_keeps_deduction() {
        let ledger = ledger().await;
        let u = user("u1");
        ledger.add(&u, amount(100), "purchase").await.unwrap();

        let outcome = ledger
            .charge(&u, amount(40), "image", || async { Ok::<_, String>("url") })
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ChargeOutcome::Completed {
                output: "url",
                balance: 60
            }
        ));
        assert_eq!(ledger.get_balance(&u).await.unwrap(), 60);
    }

    #[tokio::test]
    async fn charge_refunds_failed_work() {
        let ledger = ledger().await;
        let u = user("u1");
        ledger.add(&u, amount(100), "purchase").await.unwrap();

        let outcome = ledger
            .charge(&u, amount(40), "video", || async {
                Err::<(), _>("backend down".to_string())
            })
            .await
            .unwrap();

        assert!(matches!(outcome, ChargeOutcome::Failed { refunded: true, .. }));
        assert_eq!(ledger.get_balance(&u).await.unwrap(), 100);

        let actions: Vec<_> = ledger
            .transactions(&u, 10, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|tx| tx.action)
            .collect();
        assert_eq!(
            actions,
            [LedgerAction::Refund, LedgerAction::Deduct, LedgerAction::Add]
        );
    }

    #[tokio::test]
    async fn charge_skips_work_when_insufficient() {
        let ledger = ledger().await;
        let u = user("u1");
        let mut ran = false;

        let outcome = ledger
            .charge(&u, amount(5), "chat", || {
                ran = true;
                async { Ok::<_, String>(()) }
            })
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ChargeOutcome::Insufficient {
                available: 0,
                required: 5
            }
        ));
        assert!(!ran);
    }

    /// A store whose every call hangs.
    struct StalledStore;

    #[async_trait]
    impl Store for StalledStore {
        async fn get_balance(
            &self,
            _: &UserId,
        ) -> credit_ledger_store::Result<Option<AccountBalance>> {
            std::future::pending().await
        }
        async fn add(
            &self,
            _: &UserId,
            _: Amount,
            _: LedgerAction,
            _: &str,
        ) -> credit_ledger_store::Result<i64> {
            std::future::pending().await
        }
        async fn deduct(
            &self,
            _: &UserId,
            _: Amount,
            _: &str,
        ) -> credit_ledger_store::Result<DeductOutcome> {
            std::future::pending().await
        }
        async fn grant_if_due(
            &self,
            _: &UserId,
            _: &GrantRequest,
            _: DateTime<Utc>,
        ) -> credit_ledger_store::Result<GrantOutcome> {
            std::future::pending().await
        }
        async fn list_transactions(
            &self,
            _: &UserId,
            _: usize,
            _: usize,
        ) -> credit_ledger_store::Result<Vec<LedgerTransaction>> {
            std::future::pending().await
        }
        async fn get_plan(
            &self,
            _: &PlanId,
        ) -> credit_ledger_store::Result<Option<PlanDescriptor>> {
            std::future::pending().await
        }
        async fn put_plan(&self, _: &PlanDescriptor) -> credit_ledger_store::Result<u64> {
            std::future::pending().await
        }
        async fn catalog(&self) -> credit_ledger_store::Result<PlanCatalog> {
            std::future::pending().await
        }
        async fn seed_catalog(&self, _: &PlanCatalog) -> credit_ledger_store::Result<bool> {
            std::future::pending().await
        }
        async fn get_billing_status(
            &self,
            _: &UserId,
        ) -> credit_ledger_store::Result<Option<BillingStatus>> {
            std::future::pending().await
        }
        async fn put_billing_status(&self, _: &BillingStatus) -> credit_ledger_store::Result<()> {
            std::future::pending().await
        }
        async fn record_external_event(
            &self,
            _: &str,
            _: &str,
        ) -> credit_ledger_store::Result<bool> {
            std::future::pending().await
        }
        async fn release_external_event(&self, _: &str) -> credit_ledger_store::Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn store_timeout_is_unavailable_not_insufficient() {
        let ledger = Ledger::new(
            Arc::new(StalledStore),
            GrantPeriod::Monthly,
            Duration::from_millis(50),
        );

        let err = ledger.deduct(&user("u1"), amount(1), "chat").await.unwrap_err();
        assert!(matches!(err, LedgerError::StoreUnavailable(_)));
        assert!(err.is_retryable());
    }
}
