//! Circuit breaker service wrapping calls to external services.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::config::{CircuitConfig, CircuitConfigRegistry};
use super::store::{CircuitStore, CircuitStoreError};
use super::types::{Admission, Applied, CircuitOp, CircuitSnapshot, CircuitState, Transition};
use crate::config::ConfigError;
use crate::notifications::{Notification, NotificationBus, notify};

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// Fail-fast: the wrapped call was not attempted.
    #[error("circuit open for {service}, retry after {retry_after:?}")]
    Open { service: String, retry_after: Duration },

    /// The wrapped call failed; the error is passed through unchanged.
    #[error("{0}")]
    Inner(E),

    /// State could not be read before the call; the call was not attempted.
    #[error("circuit store unavailable: {0}")]
    Store(CircuitStoreError),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }

    /// The wrapped call's own error, if that is what this is.
    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Per-service circuit breaker.
///
/// Every decision re-reads persisted state, so all workers sharing a store
/// agree on whether a service is open.
#[derive(Clone)]
pub struct CircuitBreaker {
    store: Arc<dyn CircuitStore>,
    configs: Arc<CircuitConfigRegistry>,
    bus: NotificationBus,
}

impl CircuitBreaker {
    pub fn new(
        store: Arc<dyn CircuitStore>,
        configs: Arc<CircuitConfigRegistry>,
        bus: NotificationBus,
    ) -> Self {
        Self { store, configs, bus }
    }

    pub fn configs(&self) -> &Arc<CircuitConfigRegistry> {
        &self.configs
    }

    /// Run `call` through the circuit for `service`.
    ///
    /// - OPEN and not yet timed out: `CircuitError::Open` without calling.
    /// - OPEN and timed out: moves to HALF_OPEN, then calls.
    /// - Otherwise calls, then records the outcome.
    pub async fn execute<T, E, F, Fut>(&self, service: &str, call: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let config = self.configs.get(service);
        let admitted = self
            .store
            .apply(service, CircuitOp::Admit, &config)
            .await
            .map_err(CircuitError::Store)?;
        self.announce(service, &admitted);

        if let Admission::Rejected { retry_after } = admitted.admission {
            debug!(service, retry_after_ms = retry_after.as_millis() as u64, "circuit open, failing fast");
            return Err(CircuitError::Open {
                service: service.to_string(),
                retry_after,
            });
        }

        match call().await {
            Ok(value) => {
                self.record(service, CircuitOp::Success, &config).await;
                Ok(value)
            }
            Err(err) => {
                self.record(service, CircuitOp::Failure, &config).await;
                Err(CircuitError::Inner(err))
            }
        }
    }

    /// Like [`execute`](Self::execute), but an open circuit runs `fallback`
    /// instead of failing. The fallback's outcome is not counted.
    pub async fn execute_with_fallback<T, E, F, Fut, G, GFut>(
        &self,
        service: &str,
        call: F,
        fallback: G,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, E>>,
    {
        match self.execute(service, call).await {
            Err(CircuitError::Open { .. }) => fallback().await.map_err(CircuitError::Inner),
            other => other,
        }
    }

    pub async fn get_status(&self, service: &str) -> Result<CircuitSnapshot, CircuitStoreError> {
        self.store.get(service).await
    }

    pub async fn get_all_statuses(&self) -> Result<Vec<CircuitSnapshot>, CircuitStoreError> {
        self.store.list().await
    }

    /// Force CLOSED with both counters zeroed.
    pub async fn reset(&self, service: &str) -> Result<CircuitSnapshot, CircuitStoreError> {
        let config = self.configs.get(service);
        let applied = self.store.apply(service, CircuitOp::Reset, &config).await?;
        info!(service, "circuit reset by operator");
        self.announce(service, &applied);
        Ok(applied.snapshot)
    }

    /// Replace the thresholds of one service. Other services are untouched.
    pub fn update_config(&self, service: &str, config: CircuitConfig) -> Result<(), ConfigError> {
        self.configs.update(service, config)?;
        info!(
            service,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            timeout_ms = config.timeout.as_millis() as u64,
            "circuit config updated"
        );
        Ok(())
    }

    /// Record a call outcome. Bookkeeping failures are logged, never returned,
    /// so they cannot mask the call's own result.
    async fn record(&self, service: &str, op: CircuitOp, config: &CircuitConfig) {
        match self.store.apply(service, op, config).await {
            Ok(applied) => self.announce(service, &applied),
            Err(err) => error!(service, op = ?op, error = %err, "failed to record circuit outcome"),
        }
    }

    fn announce(&self, service: &str, applied: &Applied) {
        let Some(Transition { from, to }) = applied.transition else {
            return;
        };
        if to == CircuitState::Open {
            warn!(service, from = %from, to = %to, "circuit opened");
        } else {
            info!(service, from = %from, to = %to, "circuit transitioned");
        }
        notify(
            &self.bus,
            Notification::CircuitTransitioned {
                service: service.to_string(),
                from,
                to,
                at: Utc::now(),
            },
        );
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("configs", &self.configs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::store::InMemoryCircuitStore;
    use crate::notifications::in_memory_bus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    const SERVICE: &str = "tax-authority";

    fn breaker(failure_threshold: u32, success_threshold: u32, timeout_ms: u64) -> CircuitBreaker {
        let configs = CircuitConfigRegistry::new(CircuitConfig {
            failure_threshold,
            success_threshold,
            timeout: Duration::from_millis(timeout_ms),
        });
        CircuitBreaker::new(InMemoryCircuitStore::arc(), Arc::new(configs), in_memory_bus())
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), CircuitError<String>> {
        b.execute(SERVICE, || async { Err::<(), _>("connection refused".to_string()) }).await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<u32, CircuitError<String>> {
        b.execute(SERVICE, || async { Ok::<_, String>(7) }).await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fails_fast() {
        let b = breaker(3, 2, 60_000);
        for _ in 0..3 {
            let err = fail(&b).await.unwrap_err();
            assert_eq!(err.into_inner().as_deref(), Some("connection refused"));
        }
        assert_eq!(b.get_status(SERVICE).await.unwrap().state, CircuitState::Open);

        let calls = AtomicUsize::new(0);
        let started = Instant::now();
        let result = b
            .execute(SERVICE, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(matches!(result, Err(CircuitError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn half_open_recovery() {
        let b = breaker(3, 2, 100);
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(succeed(&b).await.unwrap(), 7);
        assert_eq!(b.get_status(SERVICE).await.unwrap().state, CircuitState::HalfOpen);

        succeed(&b).await.unwrap();
        let status = b.get_status(SERVICE).await.unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!((status.failure_count, status.success_count), (0, 0));
    }

    #[tokio::test]
    async fn half_open_regression() {
        let b = breaker(3, 2, 100);
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(matches!(fail(&b).await, Err(CircuitError::Inner(_))));
        assert_eq!(b.get_status(SERVICE).await.unwrap().state, CircuitState::Open);
    }

    #[tokio::test]
    async fn fallback_is_used_only_when_open() {
        let b = breaker(1, 1, 60_000);
        let value = b
            .execute_with_fallback(SERVICE, || async { Ok::<_, String>("live") }, || async { Ok("cached") })
            .await
            .unwrap();
        assert_eq!(value, "live");

        let _ = fail(&b).await;
        let value = b
            .execute_with_fallback(SERVICE, || async { Ok::<_, String>("live") }, || async { Ok("cached") })
            .await
            .unwrap();
        assert_eq!(value, "cached");

        // The fallback result is not counted.
        assert_eq!(b.get_status(SERVICE).await.unwrap().state, CircuitState::Open);
    }

    #[tokio::test]
    async fn services_are_isolated() {
        let b = breaker(1, 1, 60_000);
        let _ = fail(&b).await;
        let other = b.execute("source-erp", || async { Ok::<_, String>(1) }).await;
        assert_eq!(other.unwrap(), 1);

        let statuses = b.get_all_statuses().await.unwrap();
        assert_eq!(statuses.len(), 2);
    }

    #[tokio::test]
    async fn update_config_affects_only_that_service() {
        let b = breaker(5, 2, 60_000);
        b.update_config(
            SERVICE,
            CircuitConfig {
                failure_threshold: 1,
                success_threshold: 1,
                timeout: Duration::from_secs(60),
            },
        )
        .unwrap();

        let _ = fail(&b).await;
        assert_eq!(b.get_status(SERVICE).await.unwrap().state, CircuitState::Open);
        assert_eq!(b.configs().get("source-erp").failure_threshold, 5);
    }

    #[tokio::test]
    async fn reset_closes_and_publishes() {
        let b = breaker(1, 1, 60_000);
        let sub = b.bus.subscribe();
        let _ = fail(&b).await;

        let status = b.reset(SERVICE).await.unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        assert!(succeed(&b).await.is_ok());

        let transitions: Vec<_> = sub
            .drain()
            .into_iter()
            .filter_map(|n| match n {
                Notification::CircuitTransitioned { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::Closed)
            ]
        );
    }
}
