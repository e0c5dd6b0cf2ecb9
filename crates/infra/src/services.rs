//! Explicit wiring of the queue, circuit breaker and event log.
//!
//! Built once at process start and passed to whoever needs it; there are
//! no lazily-initialized globals.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::circuit::{
    CircuitBreaker, CircuitConfigRegistry, CircuitStore, InMemoryCircuitStore, PostgresCircuitStore,
};
use crate::config::{ConfigError, TaxbridgeConfig};
use crate::event_log::{EventLog, EventLogStore, InMemoryEventLogStore, PostgresEventLogStore};
use crate::jobs::{InMemoryJobQueue, JobQueue, PostgresJobQueue, PublishingJobQueue};
use crate::notifications::{NotificationBus, in_memory_bus};
use crate::schema;
use crate::worker::{Submitter, Worker};

const POOL_MAX_CONNECTIONS: u32 = 10;

/// Shared handles to every subsystem.
#[derive(Clone)]
pub struct Services {
    pub config: TaxbridgeConfig,
    pub bus: NotificationBus,
    pub queue: Arc<dyn JobQueue>,
    pub breaker: CircuitBreaker,
    pub event_log: EventLog,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Initialize logging, then wire Postgres when `database_url` is set and
    /// in-memory stores otherwise.
    pub async fn bootstrap(config: TaxbridgeConfig) -> anyhow::Result<Self> {
        taxbridge_observability::init_with(&config.logging);
        if config.database_url.is_some() {
            Self::connect(config).await
        } else {
            info!("DATABASE_URL not set, using in-memory stores");
            Ok(Self::in_memory(config)?)
        }
    }

    /// In-memory stores (tests, local development).
    pub fn in_memory(config: TaxbridgeConfig) -> Result<Self, ConfigError> {
        let queue = InMemoryJobQueue::new(config.queue);
        Self::assemble(
            config,
            in_memory_bus(),
            queue,
            Arc::new(InMemoryCircuitStore::new()),
            Arc::new(InMemoryEventLogStore::new()),
        )
    }

    /// Postgres stores; applies the schema before returning.
    pub async fn connect(config: TaxbridgeConfig) -> anyhow::Result<Self> {
        let url = config
            .database_url
            .clone()
            .context("DATABASE_URL is required for the Postgres backend")?;

        let pool = PgPoolOptions::new()
            .max_connections(POOL_MAX_CONNECTIONS)
            .connect(&url)
            .await
            .context("failed to connect to Postgres")?;
        schema::apply(&pool)
            .await
            .context("failed to apply database schema")?;
        info!("connected to Postgres");

        let queue = PostgresJobQueue::new(pool.clone(), config.queue);
        let circuits = Arc::new(PostgresCircuitStore::new(pool.clone()));
        let events = Arc::new(PostgresEventLogStore::new(pool));
        Ok(Self::assemble(config, in_memory_bus(), queue, circuits, events)?)
    }

    fn assemble<Q>(
        config: TaxbridgeConfig,
        bus: NotificationBus,
        queue: Q,
        circuits: Arc<dyn CircuitStore>,
        events: Arc<dyn EventLogStore>,
    ) -> Result<Self, ConfigError>
    where
        Q: JobQueue + 'static,
    {
        let registry = CircuitConfigRegistry::with_overrides(config.circuit, std::iter::empty())?;
        let queue: Arc<dyn JobQueue> = Arc::new(PublishingJobQueue::new(queue, bus.clone()));
        let breaker = CircuitBreaker::new(circuits, Arc::new(registry), bus.clone());
        let event_log = EventLog::new(events, bus.clone());

        Ok(Self {
            config,
            bus,
            queue,
            breaker,
            event_log,
        })
    }

    /// A worker over these services using the configured worker settings.
    pub fn worker(&self, submitter: Arc<dyn Submitter>) -> Worker {
        Worker::new(
            Arc::clone(&self.queue),
            self.breaker.clone(),
            self.event_log.clone(),
            submitter,
            self.config.worker.clone(),
        )
    }
}
