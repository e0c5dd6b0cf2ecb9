//! Database schema for the PostgreSQL backends.

use sqlx::PgPool;
use tracing::info;

/// DDL for `jobs`, `dead_letter_jobs`, `circuit_states` and `invoice_events`.
pub const SCHEMA_SQL: &str = include_str!("../migrations/0001_taxbridge.sql");

/// Create tables, indexes and triggers. Every statement is idempotent, so
/// this is safe to run at each start-up.
pub async fn apply(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    info!("database schema applied");
    Ok(())
}
