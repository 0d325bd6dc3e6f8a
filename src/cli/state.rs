use crate::application::ReconciliationService;
use crate::infrastructure::{AppConfig, PostgresBillingRepository};
use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;

pub type ReconciliationServiceType = ReconciliationService<PostgresBillingRepository>;

/// Build the service from config + an existing pool.
///
/// Intended for embedding into a larger service that already manages a `PgPool`.
pub async fn build_service_with_pool(
    config: &AppConfig,
    pool: PgPool,
    run_migrations: bool,
) -> anyhow::Result<ReconciliationServiceType> {
    if run_migrations {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("run migrations")?;
    }

    let repo = Arc::new(PostgresBillingRepository::new(pool));
    Ok(ReconciliationService::new(repo, config.reconciliation()))
}

/// Creates the `PgPool` and wires the repository into the service.
pub async fn build_service_from_env(
    config: &AppConfig,
    run_migrations: bool,
) -> anyhow::Result<ReconciliationServiceType> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("connect database")?;
    build_service_with_pool(config, pool, run_migrations).await
}
