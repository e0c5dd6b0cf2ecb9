//! Per-service circuit configuration.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Thresholds for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitConfig {
    /// Consecutive CLOSED failures that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive HALF_OPEN successes that close it again.
    pub success_threshold: u32,
    /// How long the circuit stays OPEN before probing.
    pub timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold", "0", "must be at least 1"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold", "0", "must be at least 1"));
        }
        Ok(())
    }
}

/// Injected registry of per-service configs.
///
/// Updates swap in a new map (copy-on-write); readers hold an `Arc` to a
/// complete snapshot and never see a half-applied change.
#[derive(Debug)]
pub struct CircuitConfigRegistry {
    default: CircuitConfig,
    overrides: RwLock<Arc<HashMap<String, CircuitConfig>>>,
}

impl CircuitConfigRegistry {
    pub fn new(default: CircuitConfig) -> Self {
        Self {
            default,
            overrides: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn with_overrides(
        default: CircuitConfig,
        overrides: impl IntoIterator<Item = (String, CircuitConfig)>,
    ) -> Result<Self, ConfigError> {
        default.validate()?;
        let map: HashMap<_, _> = overrides.into_iter().collect();
        for config in map.values() {
            config.validate()?;
        }
        Ok(Self {
            default,
            overrides: RwLock::new(Arc::new(map)),
        })
    }

    pub fn default_config(&self) -> CircuitConfig {
        self.default
    }

    /// Current snapshot of all overrides.
    pub fn snapshot(&self) -> Arc<HashMap<String, CircuitConfig>> {
        match self.overrides.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Config for `service`, falling back to the default.
    pub fn get(&self, service: &str) -> CircuitConfig {
        self.snapshot().get(service).copied().unwrap_or(self.default)
    }

    /// Replace the config of one service.
    pub fn update(&self, service: &str, config: CircuitConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let mut guard = match self.overrides.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = HashMap::clone(&guard);
        next.insert(service.to_string(), config);
        *guard = Arc::new(next);
        Ok(())
    }
}

impl Default for CircuitConfigRegistry {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}
