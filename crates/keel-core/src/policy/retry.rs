//! Retry policy (backoff delays) and the retry controller.

use std::time::Duration;

use crate::domain::{Decider, DenyReason, ErrorClass, RetryDecision, TaskRecord};

/// Backoff policy for failed tasks.
///
/// delay = min(max_delay, base_delay * multiplier^(attempts - 1)), plus up to
/// `jitter_ratio` of extra random delay (still capped at `max_delay`).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    pub max_delay: Duration,

    /// 0.0 disables jitter.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter_ratio: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }

    /// Delay before the next attempt, without jitter.
    ///
    /// `attempts` is the number of attempts already made (1-indexed).
    /// With base=2s, multiplier=2.0, max=60s:
    /// - attempt 1 (first failure): 2s
    /// - attempt 2: 4s
    /// - attempt 3: 8s
    /// - attempt 6: 60s (capped)
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// `next_delay` plus random jitter.
    pub fn jittered_delay(&self, attempts: u32) -> Duration {
        let delay = self.next_delay(attempts);
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let jitter = rand::random::<f64>() * delay.as_secs_f64() * self.jitter_ratio;
        (delay + Duration::from_secs_f64(jitter)).min(self.max_delay)
    }
}

/// Retry controller: a pure `Decider` enforcing both attempt ceilings.
///
/// Rules, in order:
/// 1. PERMANENT / STATE_CORRUPTION -> deny `NON_RETRYABLE_ERROR`
/// 2. task attempts >= max_retries_per_task -> deny `TASK_LIMIT_EXCEEDED`
/// 3. run attempts >= max_total_retries -> deny `GLOBAL_LIMIT_EXCEEDED`
/// 4. otherwise retry after the backoff delay
///
/// Counters are the engine's business; nothing here mutates.
#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    max_retries_per_task: u32,
    max_total_retries: u32,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, max_retries_per_task: u32, max_total_retries: u32) -> Self {
        Self {
            policy,
            max_retries_per_task,
            max_total_retries,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn max_retries_per_task(&self) -> u32 {
        self.max_retries_per_task
    }

    pub fn max_total_retries(&self) -> u32 {
        self.max_total_retries
    }

    pub fn is_retryable(class: ErrorClass) -> bool {
        matches!(class, ErrorClass::Transient | ErrorClass::Resource)
    }
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), 3, 200)
    }
}

impl Decider for RetryController {
    fn decide(&self, task: &TaskRecord, class: ErrorClass, global_attempts: u32) -> RetryDecision {
        if !Self::is_retryable(class) {
            return RetryDecision::Deny {
                reason: DenyReason::NonRetryableError,
                detail: format!("{class} errors are not retried"),
            };
        }
        if task.attempts >= self.max_retries_per_task {
            return RetryDecision::Deny {
                reason: DenyReason::TaskLimitExceeded,
                detail: format!(
                    "max attempts reached: {}/{}",
                    task.attempts, self.max_retries_per_task
                ),
            };
        }
        if !self.admits_attempt(global_attempts) {
            return RetryDecision::Deny {
                reason: DenyReason::GlobalLimitExceeded,
                detail: format!(
                    "run attempts exhausted: {}/{}",
                    global_attempts, self.max_total_retries
                ),
            };
        }

        let delay = self.policy.jittered_delay(task.attempts);
        RetryDecision::Retry {
            delay,
            reason: format!(
                "retry attempt {}/{} after {:?}",
                task.attempts + 1,
                self.max_retries_per_task,
                delay
            ),
        }
    }

    fn admits_attempt(&self, global_attempts: u32) -> bool {
        global_attempts < self.max_total_retries
    }
}
