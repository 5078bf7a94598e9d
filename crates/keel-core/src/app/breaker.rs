//! Circuit breakers, one per operation class.
//!
//! Owned by the engine (`&mut self` everywhere): the state values are only
//! replaced with what the transition functions return.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::CircuitConfig;
use crate::domain::{Admission, CircuitState};

/// A phase change, for logging and the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: &'static str,
    pub to: &'static str,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakers {
    config: CircuitConfig,
    circuits: BTreeMap<String, CircuitState>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            circuits: BTreeMap::new(),
        }
    }

    fn current(&self, operation: &str) -> CircuitState {
        self.circuits.get(operation).copied().unwrap_or_else(|| {
            CircuitState::new(self.config.failure_threshold, self.config.reset_timeout_ms)
        })
    }

    fn replace(&mut self, operation: &str, next: CircuitState) -> Option<Transition> {
        let before = self.current(operation);
        self.circuits.insert(operation.to_string(), next);
        let (from, to) = (before.phase.name(), next.phase.name());
        if from == to {
            return None;
        }
        let failures = next.consecutive_failures();
        match to {
            "OPEN" => warn!(operation, from, failures, "circuit opened"),
            _ => info!(operation, from, to, "circuit state changed"),
        }
        Some(Transition { from, to })
    }

    pub fn admit(&mut self, operation: &str, now: DateTime<Utc>) -> (Admission, Option<Transition>) {
        let (next, admission) = self.current(operation).admit(now);
        let transition = self.replace(operation, next);
        (admission, transition)
    }

    pub fn record_success(&mut self, operation: &str) -> Option<Transition> {
        let next = self.current(operation).on_success();
        self.replace(operation, next)
    }

    pub fn record_failure(&mut self, operation: &str, now: DateTime<Utc>) -> Option<Transition> {
        let next = self.current(operation).on_failure(now);
        self.replace(operation, next)
    }

    /// The admitted attempt never reported (cancelled / interrupted).
    pub fn release(&mut self, operation: &str) {
        let next = self.current(operation).release_probe();
        self.circuits.insert(operation.to_string(), next);
    }

    pub fn state(&self, operation: &str) -> CircuitState {
        self.current(operation)
    }

    /// Every circuit that has seen traffic.
    pub fn snapshot(&self) -> BTreeMap<String, CircuitState> {
        self.circuits.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn breakers() -> CircuitBreakers {
        CircuitBreakers::new(CircuitConfig {
            failure_threshold: 2,
            reset_timeout_ms: 1_000,
        })
    }

    #[test]
    fn operation_classes_are_independent() {
        let mut b = breakers();
        b.record_failure("api", at(0));
        let opened = b.record_failure("api", at(1));
        assert_eq!(
            opened,
            Some(Transition {
                from: "CLOSED",
                to: "OPEN"
            })
        );

        assert!(b.admit("api", at(2)).0.is_rejected());
        assert_eq!(b.admit("db", at(2)).0, Admission::Allowed);
    }

    #[test]
    fn full_cycle_reports_transitions() {
        let mut b = breakers();
        b.record_failure("api", at(0));
        b.record_failure("api", at(0));

        let (admission, transition) = b.admit("api", at(1_001));
        assert_eq!(admission, Admission::Probe);
        assert_eq!(transition.map(|t| t.to), Some("HALF_OPEN"));

        assert_eq!(b.record_success("api").map(|t| t.to), Some("CLOSED"));
        assert_eq!(b.record_success("api"), None);
        assert_eq!(b.snapshot().len(), 1);
    }
}
