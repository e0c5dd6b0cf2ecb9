//! PostgreSQL-backed circuit store.
//!
//! Each `apply` locks the service row (`SELECT ... FOR UPDATE`), runs the
//! pure transition function and writes the result back in one transaction,
//! so concurrent callers serialize per service and no transition is lost.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use super::config::CircuitConfig;
use super::store::{CircuitStore, CircuitStoreError};
use super::types::{Applied, CircuitOp, CircuitSnapshot};

const COLUMNS: &str = "service_name, state, failure_count, success_count, last_failure_at, \
     last_success_at, opened_at, half_opened_at, closed_at, updated_at";

/// Postgres circuit store.
#[derive(Debug, Clone)]
pub struct PostgresCircuitStore {
    pool: Arc<PgPool>,
}

impl PostgresCircuitStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn ensure_row(
        tx: &mut Transaction<'_, Postgres>,
        service: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CircuitStoreError> {
        sqlx::query(
            r#"
            INSERT INTO circuit_states (service_name, state, failure_count, success_count, updated_at)
            VALUES ($1, 'CLOSED', 0, 0, $2)
            ON CONFLICT (service_name) DO NOTHING
            "#,
        )
        .bind(service)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("ensure_circuit_row", e))?;
        Ok(())
    }
}

#[async_trait]
impl CircuitStore for PostgresCircuitStore {
    #[instrument(skip(self, config), fields(service = %service), err)]
    async fn apply(
        &self,
        service: &str,
        op: CircuitOp,
        config: &CircuitConfig,
    ) -> Result<Applied, CircuitStoreError> {
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        Self::ensure_row(&mut tx, service, now).await?;
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM circuit_states WHERE service_name = $1 FOR UPDATE"
        ))
        .bind(service)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_circuit", e))?;
        let mut snapshot = snapshot_from_row(&row)?;

        let applied = snapshot.apply(op, config, now);

        // Plain admission checks on a healthy circuit change nothing.
        if op == CircuitOp::Admit && applied.transition.is_none() {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(applied);
        }

        let s = &applied.snapshot;
        sqlx::query(
            r#"
            UPDATE circuit_states
            SET state = $2,
                failure_count = $3,
                success_count = $4,
                last_failure_at = $5,
                last_success_at = $6,
                opened_at = $7,
                half_opened_at = $8,
                closed_at = $9,
                updated_at = $10
            WHERE service_name = $1
            "#,
        )
        .bind(service)
        .bind(s.state.as_str())
        .bind(s.failure_count as i32)
        .bind(s.success_count as i32)
        .bind(s.last_failure_at)
        .bind(s.last_success_at)
        .bind(s.opened_at)
        .bind(s.half_opened_at)
        .bind(s.closed_at)
        .bind(s.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_circuit", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(applied)
    }

    async fn get(&self, service: &str) -> Result<CircuitSnapshot, CircuitStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Self::ensure_row(&mut tx, service, Utc::now()).await?;
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM circuit_states WHERE service_name = $1"))
            .bind(service)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("get_circuit", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        snapshot_from_row(&row)
    }

    async fn list(&self) -> Result<Vec<CircuitSnapshot>, CircuitStoreError> {
        let rows = sqlx::query(&format!("SELECT {COLUMNS} FROM circuit_states ORDER BY service_name"))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_circuits", e))?;
        rows.iter().map(snapshot_from_row).collect()
    }
}

fn snapshot_from_row(row: &PgRow) -> Result<CircuitSnapshot, CircuitStoreError> {
    let get = |e| map_sqlx_error("decode_circuit", e);
    let service_name: String = row.try_get("service_name").map_err(get)?;
    let state: String = row.try_get("state").map_err(get)?;
    let failure_count: i32 = row.try_get("failure_count").map_err(get)?;
    let success_count: i32 = row.try_get("success_count").map_err(get)?;

    let state = state.parse().map_err(|e| CircuitStoreError::Corrupt {
        service: service_name.clone(),
        reason: format!("{e}"),
    })?;

    Ok(CircuitSnapshot {
        state,
        failure_count: failure_count.max(0) as u32,
        success_count: success_count.max(0) as u32,
        last_failure_at: row.try_get("last_failure_at").map_err(get)?,
        last_success_at: row.try_get("last_success_at").map_err(get)?,
        opened_at: row.try_get("opened_at").map_err(get)?,
        half_opened_at: row.try_get("half_opened_at").map_err(get)?,
        closed_at: row.try_get("closed_at").map_err(get)?,
        updated_at: row.try_get("updated_at").map_err(get)?,
        service_name,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> CircuitStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            CircuitStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            CircuitStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => CircuitStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
