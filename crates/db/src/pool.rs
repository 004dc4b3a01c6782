//! Postgres connection pool and embedded migrations.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::DbError;

/// Shared Postgres pool used by every store and sink.
pub type DbPool = PgPool;

/// How long a caller waits for a free connection before the request fails.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect to `database_url` with at most `max_connections` open.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, DbError> {
    info!(max_connections, "connecting to database");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Apply the migrations under `migrations/` at the workspace root. They are
/// embedded at build time.
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    info!("running database migrations");
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}
