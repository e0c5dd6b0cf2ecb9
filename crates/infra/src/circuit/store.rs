//! Circuit state persistence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::config::CircuitConfig;
use super::types::{Applied, CircuitOp, CircuitSnapshot};

/// Circuit store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitStoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt circuit row for {service}: {reason}")]
    Corrupt { service: String, reason: String },
}

/// One row per service, created lazily on first reference.
///
/// `apply` is a read-modify-write that must be atomic per service so that
/// concurrent callers never lose a transition.
#[async_trait]
pub trait CircuitStore: Send + Sync {
    async fn apply(
        &self,
        service: &str,
        op: CircuitOp,
        config: &CircuitConfig,
    ) -> Result<Applied, CircuitStoreError>;

    async fn get(&self, service: &str) -> Result<CircuitSnapshot, CircuitStoreError>;

    /// All known services, sorted by name.
    async fn list(&self) -> Result<Vec<CircuitSnapshot>, CircuitStoreError>;
}

#[async_trait]
impl<S> CircuitStore for Arc<S>
where
    S: CircuitStore + ?Sized,
{
    async fn apply(
        &self,
        service: &str,
        op: CircuitOp,
        config: &CircuitConfig,
    ) -> Result<Applied, CircuitStoreError> {
        (**self).apply(service, op, config).await
    }

    async fn get(&self, service: &str) -> Result<CircuitSnapshot, CircuitStoreError> {
        (**self).get(service).await
    }

    async fn list(&self) -> Result<Vec<CircuitSnapshot>, CircuitStoreError> {
        (**self).list().await
    }
}

/// In-memory circuit store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCircuitStore {
    circuits: Mutex<HashMap<String, CircuitSnapshot>>,
}

impl InMemoryCircuitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, CircuitSnapshot>>, CircuitStoreError> {
        self.circuits
            .lock()
            .map_err(|_| CircuitStoreError::Storage("circuit store lock poisoned".to_string()))
    }
}

#[async_trait]
impl CircuitStore for InMemoryCircuitStore {
    async fn apply(
        &self,
        service: &str,
        op: CircuitOp,
        config: &CircuitConfig,
    ) -> Result<Applied, CircuitStoreError> {
        let mut circuits = self.lock()?;
        let now = Utc::now();
        let snapshot = circuits
            .entry(service.to_string())
            .or_insert_with(|| CircuitSnapshot::closed(service, now));
        Ok(snapshot.apply(op, config, now))
    }

    async fn get(&self, service: &str) -> Result<CircuitSnapshot, CircuitStoreError> {
        let mut circuits = self.lock()?;
        Ok(circuits
            .entry(service.to_string())
            .or_insert_with(|| CircuitSnapshot::closed(service, Utc::now()))
            .clone())
    }

    async fn list(&self) -> Result<Vec<CircuitSnapshot>, CircuitStoreError> {
        let circuits = self.lock()?;
        let mut all: Vec<_> = circuits.values().cloned().collect();
        all.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::types::CircuitState;

    #[tokio::test]
    async fn rows_are_created_lazily_and_listed_by_name() {
        let store = InMemoryCircuitStore::new();
        assert!(store.list().await.unwrap().is_empty());

        let status = store.get("zeta").await.unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        store.apply("alpha", CircuitOp::Failure, &CircuitConfig::default()).await.unwrap();

        let names: Vec<_> = store.list().await.unwrap().into_iter().map(|c| c.service_name).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_failures_are_all_counted() {
        let store = InMemoryCircuitStore::arc();
        let config = CircuitConfig {
            failure_threshold: 100,
            ..CircuitConfig::default()
        };

        let mut handles = Vec::new();
        for _ in 0..40 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.apply("authority", CircuitOp::Failure, &config).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get("authority").await.unwrap().failure_count, 40);
    }
}
