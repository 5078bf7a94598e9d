//! Circuit state for one operation class.
//!
//! Tagged-variant state with explicit transition functions. Each transition
//! consumes the current state and returns the next one; the engine is the
//! only place that stores the result.
//!
//! ```text
//! CLOSED --(failures >= threshold)--> OPEN
//! OPEN --(now - last_failure > reset_timeout)--> HALF_OPEN
//! HALF_OPEN --(probe ok)--> CLOSED
//! HALF_OPEN --(probe failed)--> OPEN
//! ```

use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Phase of a circuit, with the data each phase needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitPhase {
    Closed {
        consecutive_failures: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_failure_at: Option<DateTime<Utc>>,
    },
    Open {
        consecutive_failures: u32,
        last_failure_at: DateTime<Utc>,
    },
    HalfOpen {
        consecutive_failures: u32,
        last_failure_at: DateTime<Utc>,
        probe_in_flight: bool,
    },
}

impl CircuitPhase {
    pub fn name(&self) -> &'static str {
        match self {
            CircuitPhase::Closed { .. } => "CLOSED",
            CircuitPhase::Open { .. } => "OPEN",
            CircuitPhase::HalfOpen { .. } => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Answer to "may this attempt go through?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single trial attempt of a half-open circuit.
    Probe,
    /// Fast-fail. The circuit may admit a probe after `retry_at`.
    Rejected { retry_at: DateTime<Utc> },
}

impl Admission {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Admission::Rejected { .. })
    }
}

/// Circuit state of one operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    pub phase: CircuitPhase,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl CircuitState {
    pub fn new(failure_threshold: u32, reset_timeout_ms: u64) -> Self {
        Self {
            phase: CircuitPhase::Closed {
                consecutive_failures: 0,
                last_failure_at: None,
            },
            failure_threshold,
            reset_timeout_ms,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        match self.phase {
            CircuitPhase::Closed {
                consecutive_failures,
                ..
            }
            | CircuitPhase::Open {
                consecutive_failures,
                ..
            }
            | CircuitPhase::HalfOpen {
                consecutive_failures,
                ..
            } => consecutive_failures,
        }
    }

    pub fn last_failure_at(&self) -> Option<DateTime<Utc>> {
        match self.phase {
            CircuitPhase::Closed {
                last_failure_at, ..
            } => last_failure_at,
            CircuitPhase::Open {
                last_failure_at, ..
            }
            | CircuitPhase::HalfOpen {
                last_failure_at, ..
            } => Some(last_failure_at),
        }
    }

    fn reset_timeout(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.reset_timeout_ms as i64)
    }

    /// Ask to pass an attempt through.
    ///
    /// An open circuit whose reset timeout has elapsed moves to half-open and
    /// admits exactly one probe; everything else while open or probing is rejected.
    pub fn admit(self, now: DateTime<Utc>) -> (Self, Admission) {
        match self.phase {
            CircuitPhase::Closed { .. } => (self, Admission::Allowed),
            CircuitPhase::Open {
                consecutive_failures,
                last_failure_at,
            } => {
                let retry_at = last_failure_at + self.reset_timeout();
                if now > retry_at {
                    let next = Self {
                        phase: CircuitPhase::HalfOpen {
                            consecutive_failures,
                            last_failure_at,
                            probe_in_flight: true,
                        },
                        ..self
                    };
                    (next, Admission::Probe)
                } else {
                    // strictly after the timeout
                    let retry_at = retry_at + ChronoDuration::milliseconds(1);
                    (self, Admission::Rejected { retry_at })
                }
            }
            CircuitPhase::HalfOpen {
                consecutive_failures,
                last_failure_at,
                probe_in_flight,
            } => {
                if probe_in_flight {
                    let retry_at = now + self.reset_timeout();
                    (self, Admission::Rejected { retry_at })
                } else {
                    let next = Self {
                        phase: CircuitPhase::HalfOpen {
                            consecutive_failures,
                            last_failure_at,
                            probe_in_flight: true,
                        },
                        ..self
                    };
                    (next, Admission::Probe)
                }
            }
        }
    }

    /// The attempt succeeded: reset the counter and close.
    pub fn on_success(self) -> Self {
        Self {
            phase: CircuitPhase::Closed {
                consecutive_failures: 0,
                last_failure_at: None,
            },
            ..self
        }
    }

    /// The attempt failed.
    ///
    /// Closed: count it, open at the threshold. Half-open: the probe failed,
    /// reopen with a fresh `last_failure_at`.
    pub fn on_failure(self, now: DateTime<Utc>) -> Self {
        let failures = self.consecutive_failures().saturating_add(1);
        let phase = match self.phase {
            CircuitPhase::Closed { .. } if failures < self.failure_threshold => {
                CircuitPhase::Closed {
                    consecutive_failures: failures,
                    last_failure_at: Some(now),
                }
            }
            _ => CircuitPhase::Open {
                consecutive_failures: failures,
                last_failure_at: now,
            },
        };
        Self { phase, ..self }
    }

    /// The probe was cut off before it reported (restore, cancellation).
    /// The circuit stays half-open and admits a new probe.
    pub fn release_probe(self) -> Self {
        match self.phase {
            CircuitPhase::HalfOpen {
                consecutive_failures,
                last_failure_at,
                ..
            } => Self {
                phase: CircuitPhase::HalfOpen {
                    consecutive_failures,
                    last_failure_at,
                    probe_in_flight: false,
                },
                ..self
            },
            _ => self,
        }
    }
}
