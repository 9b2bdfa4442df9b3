pub mod partitions;
pub mod store;

pub use partitions::PartitionProvisioner;
pub use store::{ActivityRow, PgStore, SnapshotRecord, Store};

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::config::Config;

/// Connect to Postgres and verify the connection.
pub async fn connect(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_max)
        .connect(&config.database_url())
        .await
        .context("create connection pool")?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("ping database")?;

    info!("connected to database");
    Ok(pool)
}

/// Apply all embedded schema migrations in order. Already-applied
/// migrations are skipped.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!()
        .run(pool)
        .await
        .context("run migrations")?;

    info!("all migrations applied");
    Ok(())
}
