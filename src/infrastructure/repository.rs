use crate::domain::{
    BillingRecord, BillingUpsert, PlanTier, SubscriptionStatusUpdate, STATUS_CANCELED,
};
use async_trait::async_trait;
use sqlx::{PgExecutor, PgPool, Postgres, Row, Transaction};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Persistence capability the reconciliation core runs against.
///
/// Single-statement writes go straight to the pool. Multi-statement work
/// goes through [`BillingRepository::begin`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BillingRepository: Send + Sync {
    async fn find_user_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<String>, RepositoryError>;
    async fn find_user_by_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<String>, RepositoryError>;
    /// Overwrite plan label and quota counters. `NotFound` when no user row matched.
    async fn apply_plan(&self, user_id: &str, tier: PlanTier) -> Result<(), RepositoryError>;
    async fn upsert_billing_record(&self, upsert: &BillingUpsert) -> Result<(), RepositoryError>;
    /// Match by customer OR subscription reference. `NotFound` when zero rows changed.
    async fn update_subscription_status(
        &self,
        update: &SubscriptionStatusUpdate,
    ) -> Result<(), RepositoryError>;
    async fn get_billing_record(&self, user_id: &str) -> Result<BillingRecord, RepositoryError>;
    async fn begin(&self) -> Result<Box<dyn BillingTransaction>, RepositoryError>;
}

/// All-or-nothing unit of work. Dropping it without `commit` discards the writes.
#[async_trait]
pub trait BillingTransaction: Send {
    /// Returns the number of billing rows touched.
    async fn mark_canceled(&mut self, user_id: &str) -> Result<u64, RepositoryError>;
    async fn apply_plan(&mut self, user_id: &str, tier: PlanTier) -> Result<(), RepositoryError>;
    async fn commit(&mut self) -> Result<(), RepositoryError>;
    async fn rollback(&mut self) -> Result<(), RepositoryError>;
}

const APPLY_PLAN_SQL: &str = r#"
    UPDATE users
    SET post_api_calls = $1,
        get_api_calls = $2,
        edit_api_calls = $3,
        account_type = $4
    WHERE uuid = $5
"#;

const UPSERT_WITH_LIFECYCLE_SQL: &str = r#"
    INSERT INTO stripe (
        user_id, stripe_customer_id, stripe_subscription_id, price_id,
        subscription_status, current_period_start, current_period_end,
        cancel_at_period_end, updated_at
    )
    VALUES ($1, NULLIF($2, ''), NULLIF($3, ''), $4, $5, $6, $7, $8, now())
    ON CONFLICT (user_id)
    DO UPDATE SET
        stripe_customer_id = COALESCE(EXCLUDED.stripe_customer_id, stripe.stripe_customer_id),
        stripe_subscription_id = COALESCE(EXCLUDED.stripe_subscription_id, stripe.stripe_subscription_id),
        price_id = EXCLUDED.price_id,
        subscription_status = EXCLUDED.subscription_status,
        current_period_start = EXCLUDED.current_period_start,
        current_period_end = EXCLUDED.current_period_end,
        cancel_at_period_end = EXCLUDED.cancel_at_period_end,
        updated_at = now()
"#;

const UPSERT_REFERENCES_SQL: &str = r#"
    INSERT INTO stripe (user_id, stripe_customer_id, stripe_subscription_id, price_id, updated_at)
    VALUES ($1, NULLIF($2, ''), NULLIF($3, ''), $4, now())
    ON CONFLICT (user_id)
    DO UPDATE SET
        stripe_customer_id = COALESCE(EXCLUDED.stripe_customer_id, stripe.stripe_customer_id),
        stripe_subscription_id = COALESCE(EXCLUDED.stripe_subscription_id, stripe.stripe_subscription_id),
        price_id = EXCLUDED.price_id,
        updated_at = now()
"#;

async fn apply_plan_with<'e, E>(
    executor: E,
    user_id: &str,
    tier: PlanTier,
) -> Result<(), RepositoryError>
where
    E: PgExecutor<'e>,
{
    let quota = tier.quota();

    let result = sqlx::query(APPLY_PLAN_SQL)
        .bind(quota.post_api_calls)
        .bind(quota.get_api_calls)
        .bind(quota.edit_api_calls)
        .bind(tier.as_ref())
        .bind(user_id)
        .execute(executor)
        .await?;

    if result.rows_affected() == 0 {
        return Err(RepositoryError::NotFound(format!("User {}", user_id)));
    }

    Ok(())
}

pub struct PostgresBillingRepository {
    pool: PgPool,
}

impl PostgresBillingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillingRepository for PostgresBillingRepository {
    async fn find_user_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<String>, RepositoryError> {
        let user_id = sqlx::query_scalar::<_, String>(
            r#"
            SELECT user_id
            FROM stripe
            WHERE stripe_subscription_id = $1
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user_id)
    }

    async fn find_user_by_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<String>, RepositoryError> {
        let user_id = sqlx::query_scalar::<_, String>(
            r#"
            SELECT user_id
            FROM stripe
            WHERE stripe_customer_id = $1
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user_id)
    }

    async fn apply_plan(&self, user_id: &str, tier: PlanTier) -> Result<(), RepositoryError> {
        apply_plan_with(&self.pool, user_id, tier).await
    }

    async fn upsert_billing_record(&self, upsert: &BillingUpsert) -> Result<(), RepositoryError> {
        match &upsert.lifecycle {
            Some(lifecycle) => {
                sqlx::query(UPSERT_WITH_LIFECYCLE_SQL)
                    .bind(&upsert.user_id)
                    .bind(&upsert.stripe_customer_id)
                    .bind(&upsert.stripe_subscription_id)
                    .bind(&upsert.price_id)
                    .bind(&lifecycle.status)
                    .bind(lifecycle.current_period_start)
                    .bind(lifecycle.current_period_end)
                    .bind(lifecycle.cancel_at_period_end)
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                sqlx::query(UPSERT_REFERENCES_SQL)
                    .bind(&upsert.user_id)
                    .bind(&upsert.stripe_customer_id)
                    .bind(&upsert.stripe_subscription_id)
                    .bind(&upsert.price_id)
                    .execute(&self.pool)
                    .await?;
            }
        }

        Ok(())
    }

    async fn update_subscription_status(
        &self,
        update: &SubscriptionStatusUpdate,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE stripe
            SET subscription_status = $1,
                cancel_at_period_end = $2,
                canceled_at = CASE WHEN $2 THEN now() ELSE NULL END,
                updated_at = now()
            WHERE stripe_customer_id = NULLIF($3, '')
               OR stripe_subscription_id = NULLIF($4, '')
            "#,
        )
        .bind(&update.status)
        .bind(update.cancel_at_period_end)
        .bind(&update.stripe_customer_id)
        .bind(&update.stripe_subscription_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!(
                "Billing record for customer {:?} / subscription {:?}",
                update.stripe_customer_id, update.stripe_subscription_id
            )));
        }

        Ok(())
    }

    async fn get_billing_record(&self, user_id: &str) -> Result<BillingRecord, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, stripe_customer_id, stripe_subscription_id, price_id,
                   subscription_status, current_period_start, current_period_end,
                   cancel_at_period_end, canceled_at, updated_at
            FROM stripe
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => {
                RepositoryError::NotFound(format!("Billing record for user {}", user_id))
            }
            _ => RepositoryError::DatabaseError(e),
        })?;

        row_to_billing_record(&row)
    }

    async fn begin(&self) -> Result<Box<dyn BillingTransaction>, RepositoryError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresBillingTransaction { tx: Some(tx) }))
    }
}

fn row_to_billing_record(row: &sqlx::postgres::PgRow) -> Result<BillingRecord, RepositoryError> {
    Ok(BillingRecord {
        user_id: row.try_get("user_id")?,
        stripe_customer_id: row.try_get("stripe_customer_id")?,
        stripe_subscription_id: row.try_get("stripe_subscription_id")?,
        price_id: row.try_get("price_id")?,
        subscription_status: row.try_get("subscription_status")?,
        current_period_start: row.try_get("current_period_start")?,
        current_period_end: row.try_get("current_period_end")?,
        cancel_at_period_end: row.try_get("cancel_at_period_end")?,
        canceled_at: row.try_get("canceled_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub struct PostgresBillingTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PostgresBillingTransaction {
    fn open(&mut self) -> Result<&mut Transaction<'static, Postgres>, RepositoryError> {
        self.tx
            .as_mut()
            .ok_or_else(|| RepositoryError::InvalidData("Transaction already finished".to_string()))
    }
}

#[async_trait]
impl BillingTransaction for PostgresBillingTransaction {
    async fn mark_canceled(&mut self, user_id: &str) -> Result<u64, RepositoryError> {
        let tx = self.open()?;

        let result = sqlx::query(
            r#"
            UPDATE stripe
            SET subscription_status = $1,
                cancel_at_period_end = false,
                canceled_at = now(),
                updated_at = now()
            WHERE user_id = $2
            "#,
        )
        .bind(STATUS_CANCELED)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected())
    }

    async fn apply_plan(&mut self, user_id: &str, tier: PlanTier) -> Result<(), RepositoryError> {
        let tx = self.open()?;
        apply_plan_with(&mut **tx, user_id, tier).await
    }

    async fn commit(&mut self) -> Result<(), RepositoryError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| RepositoryError::InvalidData("Transaction already finished".to_string()))?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), RepositoryError> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}
