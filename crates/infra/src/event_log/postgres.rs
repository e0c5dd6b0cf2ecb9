//! PostgreSQL-backed invoice event log.
//!
//! ## Error Mapping
//!
//! | SQLx error | PostgreSQL code | EventLogError | Scenario |
//! |------------|-----------------|---------------|----------|
//! | Database (unique violation) | `23505` | `VersionConflict` | concurrent append at the same `stream_version` |
//! | Database (other) | any | `Storage` | constraint or trigger failure |
//! | PoolClosed / other | n/a | `Storage` | connectivity |
//!
//! Rows are never updated or deleted; the schema installs a trigger that
//! rejects both.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tracing::{Span, instrument};

use taxbridge_core::{DocumentId, DomainError, EventId, TenantId};
use taxbridge_documents::{DocumentState, InvoiceEvent};

use super::query::{EventFilter, EventLogStats};
use super::store::{EventLogError, EventLogStore, StreamHead};
use crate::pagination::{Page, Pagination};

const EVENT_COLUMNS: &str = "id, tenant_id, document_id, stream_version, event_type, \
     previous_state, new_state, payload, actor, actor_type, correlation_id, occurred_at";

/// Shared WHERE clause for [`EventFilter`]; see [`bind_filter`] for the
/// parameter order.
const FILTER_WHERE: &str = r#"
    WHERE ($1::uuid IS NULL OR tenant_id = $1)
        AND ($2::uuid IS NULL OR document_id = $2)
        AND ($3::text IS NULL OR event_type = $3)
        AND ($4::text IS NULL OR new_state = $4)
        AND ($5::text IS NULL OR actor = $5)
        AND ($6::text IS NULL OR actor_type = $6)
        AND ($7::text IS NULL OR correlation_id = $7)
        AND ($8::timestamptz IS NULL OR occurred_at >= $8)
        AND ($9::timestamptz IS NULL OR occurred_at < $9)
"#;

/// Postgres event log.
#[derive(Debug, Clone)]
pub struct PostgresEventLogStore {
    pool: Arc<PgPool>,
}

impl PostgresEventLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl EventLogStore for PostgresEventLogStore {
    #[instrument(
        skip(self, event),
        fields(
            document_id = %event.document_id,
            stream_version = event.stream_version,
            new_state = %event.new_state
        ),
        err
    )]
    async fn append(&self, event: &InvoiceEvent) -> Result<(), EventLogError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current = sqlx::query(
            r#"
            SELECT tenant_id, stream_version
            FROM invoice_events
            WHERE document_id = $1
            ORDER BY stream_version DESC
            LIMIT 1
            "#,
        )
        .bind(event.document_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("check_stream_version", e))?;

        let mut current_version = 0u64;
        if let Some(row) = current {
            let owner: uuid::Uuid = row
                .try_get("tenant_id")
                .map_err(|e| map_sqlx_error("check_stream_version", e))?;
            let version: i64 = row
                .try_get("stream_version")
                .map_err(|e| map_sqlx_error("check_stream_version", e))?;
            if owner != *event.tenant_id.as_uuid() {
                return Err(EventLogError::TenantMismatch {
                    document_id: event.document_id,
                    owner: TenantId::from_uuid(owner),
                });
            }
            current_version = version.max(0) as u64;
        }

        if event.stream_version != current_version + 1 {
            return Err(EventLogError::VersionConflict {
                document_id: event.document_id,
                stream_version: event.stream_version,
            });
        }

        sqlx::query(&format!(
            "INSERT INTO invoice_events ({EVENT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(event.id.as_uuid())
        .bind(event.tenant_id.as_uuid())
        .bind(event.document_id.as_uuid())
        .bind(event.stream_version as i64)
        .bind(event.event_type.as_str())
        .bind(event.previous_state.map(|s| s.as_str()))
        .bind(event.new_state.as_str())
        .bind(&event.payload)
        .bind(&event.actor)
        .bind(event.actor_type.as_str())
        .bind(event.correlation_id.as_deref())
        .bind(event.occurred_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EventLogError::VersionConflict {
                    document_id: event.document_id,
                    stream_version: event.stream_version,
                }
            } else {
                map_sqlx_error("insert_event", e)
            }
        })?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self), fields(document_id = %document_id), err)]
    async fn head(&self, document_id: DocumentId) -> Result<Option<StreamHead>, EventLogError> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, new_state, stream_version, occurred_at
            FROM invoice_events
            WHERE document_id = $1
            ORDER BY occurred_at DESC, stream_version DESC
            LIMIT 1
            "#,
        )
        .bind(document_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("head", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let get = |e| map_sqlx_error("decode_head", e);
        let state: String = row.try_get("new_state").map_err(get)?;
        let version: i64 = row.try_get("stream_version").map_err(get)?;
        Ok(Some(StreamHead {
            tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(get)?),
            state: state.parse().map_err(decode_error)?,
            stream_version: version.max(0) as u64,
            occurred_at: row.try_get("occurred_at").map_err(get)?,
        }))
    }

    #[instrument(skip(self), fields(document_id = %document_id, returned = tracing::field::Empty), err)]
    async fn history(
        &self,
        document_id: DocumentId,
        pagination: Pagination,
    ) -> Result<Vec<InvoiceEvent>, EventLogError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM invoice_events WHERE document_id = $1 \
             ORDER BY occurred_at ASC, stream_version ASC LIMIT $2 OFFSET $3"
        ))
        .bind(document_id.as_uuid())
        .bind(i64::from(pagination.limit))
        .bind(i64::from(pagination.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("history", e))?;

        let events = rows.iter().map(event_from_row).collect::<Result<Vec<_>, _>>()?;
        Span::current().record("returned", events.len());
        Ok(events)
    }

    #[instrument(skip(self), fields(document_id = %document_id), err)]
    async fn load_stream(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<InvoiceEvent>, EventLogError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM invoice_events WHERE document_id = $1 \
             ORDER BY stream_version ASC"
        ))
        .bind(document_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        rows.iter().map(event_from_row).collect()
    }

    #[instrument(skip(self, filter), err)]
    async fn query(
        &self,
        filter: &EventFilter,
        pagination: Pagination,
    ) -> Result<Page<InvoiceEvent>, EventLogError> {
        let count_sql = format!("SELECT COUNT(*) AS total FROM invoice_events {FILTER_WHERE}");
        let total: i64 = bind_filter(sqlx::query(&count_sql), filter)
            .fetch_one(&*self.pool)
            .await
            .and_then(|row| row.try_get("total"))
            .map_err(|e| map_sqlx_error("count_events", e))?;

        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM invoice_events {FILTER_WHERE} \
             ORDER BY occurred_at DESC, stream_version DESC LIMIT $10 OFFSET $11"
        );
        let rows = bind_filter(sqlx::query(&sql), filter)
            .bind(i64::from(pagination.limit))
            .bind(i64::from(pagination.offset))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("query_events", e))?;

        let items = rows.iter().map(event_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, total.max(0) as u64, pagination))
    }

    #[instrument(skip(self, filter), fields(returned = tracing::field::Empty), err)]
    async fn scan(&self, filter: &EventFilter) -> Result<Vec<InvoiceEvent>, EventLogError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM invoice_events {FILTER_WHERE} \
             ORDER BY occurred_at ASC, document_id ASC, stream_version ASC"
        );
        let rows = bind_filter(sqlx::query(&sql), filter)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("scan_events", e))?;

        let events = rows.iter().map(event_from_row).collect::<Result<Vec<_>, _>>()?;
        Span::current().record("returned", events.len());
        Ok(events)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self, tenant_id: Option<TenantId>) -> Result<EventLogStats, EventLogError> {
        let tenant = tenant_id.map(uuid::Uuid::from);
        let get = |e| map_sqlx_error("stats", e);

        let rows = sqlx::query(
            r#"
            SELECT event_type, new_state, actor_type, COUNT(*) AS total
            FROM invoice_events
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
            GROUP BY event_type, new_state, actor_type
            "#,
        )
        .bind(tenant)
        .fetch_all(&*self.pool)
        .await
        .map_err(get)?;

        let mut stats = EventLogStats::default();
        for row in rows {
            let event_type: String = row.try_get("event_type").map_err(get)?;
            let new_state: String = row.try_get("new_state").map_err(get)?;
            let actor_type: String = row.try_get("actor_type").map_err(get)?;
            let total = row.try_get::<i64, _>("total").map_err(get)?.max(0) as u64;

            stats.total_events += total;
            *stats
                .by_event_type
                .entry(event_type.parse().map_err(decode_error)?)
                .or_default() += total;
            *stats
                .by_new_state
                .entry(new_state.parse().map_err(decode_error)?)
                .or_default() += total;
            *stats
                .by_actor_type
                .entry(actor_type.parse().map_err(decode_error)?)
                .or_default() += total;
        }

        let rows = sqlx::query(
            r#"
            SELECT new_state, COUNT(*) AS documents
            FROM (
                SELECT DISTINCT ON (document_id) new_state
                FROM invoice_events
                WHERE ($1::uuid IS NULL OR tenant_id = $1)
                ORDER BY document_id, occurred_at DESC, stream_version DESC
            ) latest
            GROUP BY new_state
            "#,
        )
        .bind(tenant)
        .fetch_all(&*self.pool)
        .await
        .map_err(get)?;

        for row in rows {
            let state: String = row.try_get("new_state").map_err(get)?;
            let documents = row.try_get::<i64, _>("documents").map_err(get)?.max(0) as u64;
            let state: DocumentState = state.parse().map_err(decode_error)?;
            stats.documents += documents;
            stats.current_states.insert(state, documents);
        }

        Ok(stats)
    }
}

/// Bind `$1..$9` of [`FILTER_WHERE`].
fn bind_filter<'q>(
    query: Query<'q, Postgres, PgArguments>,
    filter: &'q EventFilter,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(filter.tenant_id.map(uuid::Uuid::from))
        .bind(filter.document_id.map(uuid::Uuid::from))
        .bind(filter.event_type.map(|t| t.as_str()))
        .bind(filter.new_state.map(|s| s.as_str()))
        .bind(filter.actor.as_deref())
        .bind(filter.actor_type.map(|t| t.as_str()))
        .bind(filter.correlation_id.as_deref())
        .bind(filter.occurred_after)
        .bind(filter.occurred_before)
}

fn event_from_row(row: &PgRow) -> Result<InvoiceEvent, EventLogError> {
    let get = |e| map_sqlx_error("decode_event", e);
    let version: i64 = row.try_get("stream_version").map_err(get)?;
    let event_type: String = row.try_get("event_type").map_err(get)?;
    let previous: Option<String> = row.try_get("previous_state").map_err(get)?;
    let new_state: String = row.try_get("new_state").map_err(get)?;
    let actor_type: String = row.try_get("actor_type").map_err(get)?;

    Ok(InvoiceEvent {
        id: EventId::from_uuid(row.try_get("id").map_err(get)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(get)?),
        document_id: DocumentId::from_uuid(row.try_get("document_id").map_err(get)?),
        stream_version: version.max(0) as u64,
        event_type: event_type.parse().map_err(decode_error)?,
        previous_state: previous
            .map(|s| s.parse::<DocumentState>())
            .transpose()
            .map_err(decode_error)?,
        new_state: new_state.parse().map_err(decode_error)?,
        payload: row.try_get("payload").map_err(get)?,
        actor: row.try_get("actor").map_err(get)?,
        actor_type: actor_type.parse().map_err(decode_error)?,
        correlation_id: row.try_get("correlation_id").map_err(get)?,
        occurred_at: row.try_get("occurred_at").map_err(get)?,
    })
}

fn decode_error(err: DomainError) -> EventLogError {
    EventLogError::Storage(format!("failed to decode row: {err}"))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

/// Map SQLx errors to `EventLogError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventLogError {
    match err {
        sqlx::Error::Database(db_err) => {
            EventLogError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            EventLogError::Storage(format!("connection pool closed in {operation}"))
        }
        other => EventLogError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
