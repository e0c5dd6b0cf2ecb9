//! Circuit state and the pure transition function.
//!
//! ```text
//! CLOSED --(failures >= failure_threshold)--> OPEN
//! OPEN --(timeout elapsed, next call)--> HALF_OPEN
//! HALF_OPEN --(successes >= success_threshold)--> CLOSED
//! HALF_OPEN --(any failure)--> OPEN
//! ```
//!
//! Both counters are zeroed on every transition. Stores apply operations
//! atomically per service, so this function is the only place the machine
//! lives.

use core::fmt;
use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taxbridge_core::DomainError;

use super::config::CircuitConfig;

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected without reaching the service.
    Open,
    /// Probe calls are let through to test recovery.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CircuitState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CLOSED" => Ok(CircuitState::Closed),
            "OPEN" => Ok(CircuitState::Open),
            "HALF_OPEN" => Ok(CircuitState::HalfOpen),
            other => Err(DomainError::unknown_variant("circuit state", other)),
        }
    }
}

/// Persisted health of one external service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub service_name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// An operation applied to a circuit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitOp {
    /// Ask whether a call may proceed.
    Admit,
    /// The wrapped call succeeded.
    Success,
    /// The wrapped call failed.
    Failure,
    /// Operator override back to CLOSED.
    Reset,
}

/// A state change caused by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Answer to [`CircuitOp::Admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Rejected { retry_after: Duration },
}

/// Outcome of applying one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub snapshot: CircuitSnapshot,
    pub admission: Admission,
    pub transition: Option<Transition>,
}

impl CircuitSnapshot {
    /// A fresh CLOSED row.
    pub fn closed(service_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            service_name: service_name.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            last_success_at: None,
            opened_at: None,
            half_opened_at: None,
            closed_at: None,
            updated_at: now,
        }
    }

    /// Time left before an OPEN circuit lets a probe through.
    pub fn remaining_open(&self, config: &CircuitConfig, now: DateTime<Utc>) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }
        let elapsed = self
            .opened_at
            .and_then(|at| (now - at).to_std().ok())
            .unwrap_or(Duration::ZERO);
        Some(config.timeout.saturating_sub(elapsed))
    }

    fn transition_to(&mut self, to: CircuitState, now: DateTime<Utc>) -> Transition {
        let from = self.state;
        self.state = to;
        self.failure_count = 0;
        self.success_count = 0;
        match to {
            CircuitState::Open => self.opened_at = Some(now),
            CircuitState::HalfOpen => self.half_opened_at = Some(now),
            CircuitState::Closed => self.closed_at = Some(now),
        }
        Transition { from, to }
    }

    /// Apply `op` at `now`, mutating the snapshot in place.
    pub fn apply(&mut self, op: CircuitOp, config: &CircuitConfig, now: DateTime<Utc>) -> Applied {
        let mut admission = Admission::Allowed;
        let mut transition = None;

        match (op, self.state) {
            (CircuitOp::Admit, CircuitState::Open) => match self.remaining_open(config, now) {
                Some(remaining) if !remaining.is_zero() => {
                    admission = Admission::Rejected {
                        retry_after: remaining,
                    };
                }
                _ => transition = Some(self.transition_to(CircuitState::HalfOpen, now)),
            },
            (CircuitOp::Admit, _) => {}

            (CircuitOp::Success, CircuitState::HalfOpen) => {
                self.last_success_at = Some(now);
                self.success_count += 1;
                if self.success_count >= config.success_threshold {
                    transition = Some(self.transition_to(CircuitState::Closed, now));
                }
            }
            (CircuitOp::Success, CircuitState::Closed) => {
                self.last_success_at = Some(now);
                self.failure_count = 0;
            }
            // A call admitted before another caller opened the circuit.
            (CircuitOp::Success, CircuitState::Open) => self.last_success_at = Some(now),

            (CircuitOp::Failure, CircuitState::HalfOpen) => {
                self.last_failure_at = Some(now);
                transition = Some(self.transition_to(CircuitState::Open, now));
            }
            (CircuitOp::Failure, CircuitState::Closed) => {
                self.last_failure_at = Some(now);
                self.failure_count += 1;
                if self.failure_count >= config.failure_threshold {
                    transition = Some(self.transition_to(CircuitState::Open, now));
                }
            }
            (CircuitOp::Failure, CircuitState::Open) => self.last_failure_at = Some(now),

            (CircuitOp::Reset, CircuitState::Closed) => {
                self.failure_count = 0;
                self.success_count = 0;
            }
            (CircuitOp::Reset, _) => transition = Some(self.transition_to(CircuitState::Closed, now)),
        }

        self.updated_at = now;
        Applied {
            snapshot: self.clone(),
            admission,
            transition,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_millis(100),
        }
    }

    fn ms(n: i64) -> chrono::Duration {
        chrono::Duration::milliseconds(n)
    }

    #[test]
    fn opens_after_threshold_failures() {
        let t0 = Utc::now();
        let mut c = CircuitSnapshot::closed("authority", t0);
        assert!(c.apply(CircuitOp::Failure, &config(), t0).transition.is_none());
        assert!(c.apply(CircuitOp::Failure, &config(), t0).transition.is_none());
        let applied = c.apply(CircuitOp::Failure, &config(), t0);

        assert_eq!(
            applied.transition,
            Some(Transition {
                from: CircuitState::Closed,
                to: CircuitState::Open
            })
        );
        assert_eq!(c.failure_count, 0);
        assert_eq!(c.opened_at, Some(t0));

        let admit = c.apply(CircuitOp::Admit, &config(), t0 + ms(40));
        assert_eq!(
            admit.admission,
            Admission::Rejected {
                retry_after: Duration::from_millis(60)
            }
        );
    }

    #[test]
    fn success_in_closed_clears_failures() {
        let t0 = Utc::now();
        let mut c = CircuitSnapshot::closed("authority", t0);
        c.apply(CircuitOp::Failure, &config(), t0);
        c.apply(CircuitOp::Failure, &config(), t0);
        c.apply(CircuitOp::Success, &config(), t0);
        assert_eq!(c.failure_count, 0);
        assert_eq!(c.last_success_at, Some(t0));

        // Two more failures are not enough to open.
        c.apply(CircuitOp::Failure, &config(), t0);
        c.apply(CircuitOp::Failure, &config(), t0);
        assert_eq!(c.state, CircuitState::Closed);
    }

    #[test]
    fn half_open_recovers_after_success_threshold() {
        let t0 = Utc::now();
        let mut c = CircuitSnapshot::closed("authority", t0);
        for _ in 0..3 {
            c.apply(CircuitOp::Failure, &config(), t0);
        }

        let admit = c.apply(CircuitOp::Admit, &config(), t0 + ms(150));
        assert_eq!(admit.admission, Admission::Allowed);
        assert_eq!(c.state, CircuitState::HalfOpen);

        c.apply(CircuitOp::Success, &config(), t0 + ms(151));
        assert_eq!(c.state, CircuitState::HalfOpen);
        assert_eq!(c.success_count, 1);

        let applied = c.apply(CircuitOp::Success, &config(), t0 + ms(152));
        assert_eq!(applied.transition.map(|t| t.to), Some(CircuitState::Closed));
        assert_eq!((c.failure_count, c.success_count), (0, 0));
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let t0 = Utc::now();
        let mut c = CircuitSnapshot::closed("authority", t0);
        for _ in 0..3 {
            c.apply(CircuitOp::Failure, &config(), t0);
        }
        c.apply(CircuitOp::Admit, &config(), t0 + ms(150));
        c.apply(CircuitOp::Success, &config(), t0 + ms(151));

        let applied = c.apply(CircuitOp::Failure, &config(), t0 + ms(152));
        assert_eq!(
            applied.transition,
            Some(Transition {
                from: CircuitState::HalfOpen,
                to: CircuitState::Open
            })
        );
        assert_eq!(c.opened_at, Some(t0 + ms(152)));
        assert_eq!(c.success_count, 0);
    }

    #[test]
    fn reset_closes_from_any_state() {
        let t0 = Utc::now();
        let mut c = CircuitSnapshot::closed("authority", t0);
        for _ in 0..3 {
            c.apply(CircuitOp::Failure, &config(), t0);
        }
        let applied = c.apply(CircuitOp::Reset, &config(), t0);
        assert_eq!(applied.transition.map(|t| t.from), Some(CircuitState::Open));
        assert_eq!(c.state, CircuitState::Closed);
    }

    fn any_op() -> impl Strategy<Value = CircuitOp> {
        prop::sample::select(vec![
            CircuitOp::Admit,
            CircuitOp::Success,
            CircuitOp::Failure,
            CircuitOp::Reset,
        ])
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: only the documented edges are ever taken, and counters
        /// are zero right after every transition.
        #[test]
        fn only_legal_edges(ops in prop::collection::vec((any_op(), 0i64..80), 1..60)) {
            let mut now = Utc::now();
            let mut c = CircuitSnapshot::closed("svc", now);
            for (op, step) in ops {
                now += ms(step);
                let applied = c.apply(op, &config(), now);
                if let Some(Transition { from, to }) = applied.transition {
                    let legal = matches!(
                        (from, to),
                        (CircuitState::Closed, CircuitState::Open)
                            | (CircuitState::Open, CircuitState::HalfOpen)
                            | (CircuitState::HalfOpen, CircuitState::Closed)
                            | (CircuitState::HalfOpen, CircuitState::Open)
                    ) || (op == CircuitOp::Reset && to == CircuitState::Closed);
                    prop_assert!(legal, "{from:?} -> {to:?} via {op:?}");
                    prop_assert_eq!((c.failure_count, c.success_count), (0, 0));
                }
                prop_assert!(c.failure_count < config().failure_threshold);
                prop_assert!(c.success_count < config().success_threshold);
            }
        }
    }
}
