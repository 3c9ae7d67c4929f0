//! PostgreSQL storage implementation.
//!
//! Balance changes are single conditional statements, so the row lock taken
//! by PostgreSQL serializes concurrent callers on the same user regardless of
//! how many service instances are running. The grant check needs a read
//! before the write and takes the row lock explicitly with `FOR UPDATE`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};

use credit_ledger_core::{
    AccountBalance, Amount, BillingStatus, DeductOutcome, GrantOutcome, GrantRequest,
    LedgerAction, LedgerTransaction, PlanCatalog, PlanDescriptor, PlanId, UserId,
};

use crate::error::{Result, StoreError};
use crate::Store;

/// Maximum pooled connections per service instance.
const MAX_CONNECTIONS: u32 = 10;

/// PostgreSQL-backed storage implementation.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to the database.
    ///
    /// `acquire_timeout` bounds how long a call waits for a pooled connection;
    /// running out of time surfaces as [`StoreError::Unavailable`].
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be reached.
    pub async fn connect(database_url: &str, acquire_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(map_sqlx)?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending schema migrations.
    ///
    /// Migrations are versioned files applied in order and recorded in the
    /// `_sqlx_migrations` table, so running this on every start is safe.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails or the recorded history diverges
    /// from the embedded files.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("migration failed: {e}")))?;
        tracing::info!("database migrations applied");
        Ok(())
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        _ => StoreError::Database(err.to_string()),
    }
}

/// SQLSTATE `numeric_value_out_of_range`, raised when `credits` would leave
/// the BIGINT range.
const NUMERIC_OUT_OF_RANGE: &str = "22003";

fn map_credit_sqlx(err: sqlx::Error, amount: Amount) -> StoreError {
    let out_of_range = err
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == NUMERIC_OUT_OF_RANGE);
    if out_of_range {
        StoreError::BalanceOverflow {
            amount: amount.get(),
        }
    } else {
        map_sqlx(err)
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[derive(sqlx::FromRow)]
struct BalanceRow {
    user_id: String,
    credits: i64,
    updated_at: DateTime<Utc>,
    last_grant_at: Option<DateTime<Utc>>,
}

impl TryFrom<BalanceRow> for AccountBalance {
    type Error = StoreError;

    fn try_from(row: BalanceRow) -> Result<Self> {
        Ok(Self {
            user_id: UserId::new(row.user_id).map_err(corrupt)?,
            credits: row.credits,
            updated_at: row.updated_at,
            last_grant_at: row.last_grant_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: String,
    user_id: String,
    action: String,
    amount: i64,
    reason: String,
    balance_after: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for LedgerTransaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self> {
        Ok(Self {
            id: row.id.parse().map_err(corrupt)?,
            user_id: UserId::new(row.user_id).map_err(corrupt)?,
            action: row.action.parse().map_err(corrupt)?,
            amount: row.amount,
            reason: row.reason,
            balance_after: row.balance_after,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PlanRow {
    plan_id: String,
    monthly_credits: i64,
}

impl TryFrom<PlanRow> for PlanDescriptor {
    type Error = StoreError;

    fn try_from(row: PlanRow) -> Result<Self> {
        Ok(Self {
            plan_id: PlanId::new(row.plan_id).map_err(corrupt)?,
            monthly_credits: row.monthly_credits,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BillingRow {
    user_id: String,
    plan_id: Option<String>,
    status: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BillingRow> for BillingStatus {
    type Error = StoreError;

    fn try_from(row: BillingRow) -> Result<Self> {
        Ok(Self {
            user_id: UserId::new(row.user_id).map_err(corrupt)?,
            plan_id: row.plan_id.map(PlanId::new).transpose().map_err(corrupt)?,
            status: row.status.parse().map_err(corrupt)?,
            updated_at: row.updated_at,
        })
    }
}

fn corrupt(err: impl std::fmt::Display) -> StoreError {
    StoreError::Serialization(format!("invalid stored value: {err}"))
}

async fn insert_transaction(conn: &mut PgConnection, record: &LedgerTransaction) -> Result<()> {
    sqlx::query(
        "INSERT INTO ledger_transactions (id, user_id, action, amount, reason, balance_after, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(record.id.to_string())
    .bind(record.user_id.as_str())
    .bind(record.action.as_str())
    .bind(record.amount)
    .bind(&record.reason)
    .bind(record.balance_after)
    .bind(record.created_at)
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx)?;
    Ok(())
}

async fn catalog_version(conn: &mut PgConnection) -> Result<u64> {
    let (version,): (i64,) = sqlx::query_as("SELECT version FROM plan_catalog WHERE singleton")
        .fetch_one(&mut *conn)
        .await
        .map_err(map_sqlx)?;
    u64::try_from(version).map_err(corrupt)
}

#[async_trait]
impl Store for PgStore {
    async fn get_balance(&self, user_id: &UserId) -> Result<Option<AccountBalance>> {
        sqlx::query_as::<_, BalanceRow>(
            "SELECT user_id, credits, updated_at, last_grant_at
             FROM account_balances WHERE user_id = $1",
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .map(AccountBalance::try_from)
        .transpose()
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
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let (balance,): (i64,) = sqlx::query_as(
            "INSERT INTO account_balances (user_id, credits, updated_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (user_id) DO UPDATE
                SET credits = account_balances.credits + EXCLUDED.credits,
                    updated_at = EXCLUDED.updated_at
             RETURNING credits",
        )
        .bind(user_id.as_str())
        .bind(amount.get())
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_credit_sqlx(e, amount))?;

        let record =
            LedgerTransaction::new(user_id.clone(), action, amount.get(), reason, balance, now);
        insert_transaction(&mut tx, &record).await?;
        tx.commit().await.map_err(map_sqlx)?;

        Ok(balance)
    }

    async fn deduct(
        &self,
        user_id: &UserId,
        amount: Amount,
        reason: &str,
    ) -> Result<DeductOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let updated: Option<(i64,)> = sqlx::query_as(
            "UPDATE account_balances
                SET credits = credits - $2, updated_at = $3
              WHERE user_id = $1 AND credits >= $2
             RETURNING credits",
        )
        .bind(user_id.as_str())
        .bind(amount.get())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let Some((balance,)) = updated else {
            let current: Option<(i64,)> =
                sqlx::query_as("SELECT credits FROM account_balances WHERE user_id = $1")
                    .bind(user_id.as_str())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
            tx.rollback().await.map_err(map_sqlx)?;

            return Ok(DeductOutcome::Insufficient {
                available: current.map_or(0, |(c,)| c),
                required: amount.get(),
            });
        };

        let record = LedgerTransaction::new(
            user_id.clone(),
            LedgerAction::Deduct,
            amount.get(),
            reason,
            balance,
            now,
        );
        insert_transaction(&mut tx, &record).await?;
        tx.commit().await.map_err(map_sqlx)?;

        Ok(DeductOutcome::Applied { balance })
    }

    async fn grant_if_due(
        &self,
        user_id: &UserId,
        grant: &GrantRequest,
        now: DateTime<Utc>,
    ) -> Result<GrantOutcome> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        sqlx::query(
            "INSERT INTO account_balances (user_id, credits, updated_at)
             VALUES ($1, 0, $2)
             ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let (credits, last_grant_at): (i64, Option<DateTime<Utc>>) = sqlx::query_as(
            "SELECT credits, last_grant_at FROM account_balances
              WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        if !grant.period.is_due(last_grant_at, now) {
            tx.commit().await.map_err(map_sqlx)?;
            return Ok(GrantOutcome::not_granted(credits));
        }

        sqlx::query(
            "UPDATE account_balances
                SET credits = $2, last_grant_at = $3, updated_at = $3
              WHERE user_id = $1",
        )
        .bind(user_id.as_str())
        .bind(grant.credits)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let record = LedgerTransaction::grant(user_id.clone(), &grant.plan_id, grant.credits, now);
        insert_transaction(&mut tx, &record).await?;
        tx.commit().await.map_err(map_sqlx)?;

        Ok(GrantOutcome::granted(grant.credits))
    }

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerTransaction>> {
        sqlx::query_as::<_, TransactionRow>(
            "SELECT id, user_id, action, amount, reason, balance_after, created_at
             FROM ledger_transactions
             WHERE user_id = $1
             ORDER BY id DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(user_id.as_str())
        .bind(to_i64(limit))
        .bind(to_i64(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?
        .into_iter()
        .map(LedgerTransaction::try_from)
        .collect()
    }

    async fn get_plan(&self, plan_id: &PlanId) -> Result<Option<PlanDescriptor>> {
        sqlx::query_as::<_, PlanRow>(
            "SELECT plan_id, monthly_credits FROM plans WHERE plan_id = $1",
        )
        .bind(plan_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .map(PlanDescriptor::try_from)
        .transpose()
    }

    async fn put_plan(&self, plan: &PlanDescriptor) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        sqlx::query(
            "INSERT INTO plans (plan_id, monthly_credits, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (plan_id) DO UPDATE
                SET monthly_credits = EXCLUDED.monthly_credits,
                    updated_at = EXCLUDED.updated_at",
        )
        .bind(plan.plan_id.as_str())
        .bind(plan.monthly_credits)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let (version,): (i64,) = sqlx::query_as(
            "UPDATE plan_catalog SET version = version + 1 WHERE singleton RETURNING version",
        )
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        u64::try_from(version).map_err(corrupt)
    }

    async fn catalog(&self) -> Result<PlanCatalog> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx)?;
        let version = catalog_version(&mut conn).await?;

        let plans: BTreeMap<_, _> = sqlx::query_as::<_, PlanRow>(
            "SELECT plan_id, monthly_credits FROM plans ORDER BY plan_id",
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(map_sqlx)?
        .into_iter()
        .map(|row| PlanDescriptor::try_from(row).map(|p| (p.plan_id.clone(), p)))
        .collect::<Result<_>>()?;

        Ok(PlanCatalog { version, plans })
    }

    async fn seed_catalog(&self, catalog: &PlanCatalog) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        // Serialize concurrent seeders on the catalog row.
        sqlx::query("SELECT version FROM plan_catalog WHERE singleton FOR UPDATE")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        let (existing,): (i64,) = sqlx::query_as("SELECT count(*) FROM plans")
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        if existing > 0 {
            tx.rollback().await.map_err(map_sqlx)?;
            return Ok(false);
        }

        for plan in catalog.iter() {
            sqlx::query(
                "INSERT INTO plans (plan_id, monthly_credits, updated_at) VALUES ($1, $2, now())",
            )
            .bind(plan.plan_id.as_str())
            .bind(plan.monthly_credits)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        let version = i64::try_from(catalog.version.max(1)).map_err(corrupt)?;
        sqlx::query("UPDATE plan_catalog SET version = $1 WHERE singleton")
            .bind(version)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        tracing::info!(plans = catalog.plans.len(), "seeded plan catalog");
        Ok(true)
    }

    async fn get_billing_status(&self, user_id: &UserId) -> Result<Option<BillingStatus>> {
        sqlx::query_as::<_, BillingRow>(
            "SELECT user_id, plan_id, status, updated_at
             FROM billing_statuses WHERE user_id = $1",
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .map(BillingStatus::try_from)
        .transpose()
    }

    async fn put_billing_status(&self, status: &BillingStatus) -> Result<()> {
        sqlx::query(
            "INSERT INTO billing_statuses (user_id, plan_id, status, updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (user_id) DO UPDATE
                SET plan_id = EXCLUDED.plan_id,
                    status = EXCLUDED.status,
                    updated_at = EXCLUDED.updated_at",
        )
        .bind(status.user_id.as_str())
        .bind(status.plan_id.as_ref().map(PlanId::as_str))
        .bind(status.status.as_str())
        .bind(status.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn record_external_event(&self, event_id: &str, event_type: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO processed_external_events (event_id, event_type, processed_at)
             VALUES ($1, $2, now())
             ON CONFLICT DO NOTHING",
        )
        .bind(event_id)
        .bind(event_type)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_external_event(&self, event_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM processed_external_events WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}
