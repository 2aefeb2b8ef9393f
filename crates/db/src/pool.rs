//! Postgres connection pool for the run-history tables.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::DbError;

/// Type alias for the shared Postgres pool.
pub type DbPool = PgPool;

/// How long the runner waits for a free connection before giving up.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Create a new connection pool from the given `database_url`.
///
/// The runner writes a handful of rows per task, so small pools suffice.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, DbError> {
    info!("connecting to run-history database (max_connections={max_connections})");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Apply the embedded migrations from the workspace `migrations/` directory.
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    info!("applying run-history migrations");
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}
