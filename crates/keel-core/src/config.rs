//! Orchestrator configuration (`keel.toml`).
//!
//! Every section is optional; a missing file or section means defaults.
//!
//! ```toml
//! state_dir = ".keel"
//!
//! [retry]
//! max_retries_per_task = 3
//! max_total_retries = 200
//!
//! [circuit]
//! failure_threshold = 5
//! reset_timeout_ms = 60000
//!
//! [classification]
//! quota_exceeded = "resource"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ErrorClass;
use crate::policy::{ErrorClassifier, RetryController, RetryPolicy};

pub const DEFAULT_CONFIG_FILE: &str = "keel.toml";
pub const DEFAULT_STATE_DIR: &str = ".keel";
pub const POINTS_DIR: &str = "points";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries_per_task: u32,
    pub max_total_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries_per_task: 3,
            max_total_retries: 200,
            base_delay_ms: 2_000,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.backoff_factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_ratio: self.jitter_ratio,
        }
    }

    pub fn controller(&self) -> RetryController {
        RetryController::new(
            self.policy(),
            self.max_retries_per_task,
            self.max_total_retries,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

/// Health monitor thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    pub interval_ms: u64,

    /// Stuck-task WARNING threshold. Unset: the task's own execution timeout.
    pub stuck_warning_ms: Option<u64>,
    /// Stuck-task CRITICAL threshold. Unset: twice the warning threshold.
    pub stuck_critical_ms: Option<u64>,

    /// Trailing window for error-rate detection.
    pub error_window_ms: u64,
    /// Failed attempts within the window.
    pub error_rate_warning: u32,
    pub error_rate_critical: u32,

    pub cpu_warning: f64,
    pub cpu_critical: f64,
    pub memory_warning: f64,
    pub memory_critical: f64,
    pub disk_warning: f64,
    pub disk_critical: f64,

    /// WARNING events are surfaced as a digest every N ticks.
    pub warning_digest_every: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            stuck_warning_ms: None,
            stuck_critical_ms: None,
            error_window_ms: 600_000,
            error_rate_warning: 3,
            error_rate_critical: 6,
            cpu_warning: 90.0,
            cpu_critical: 98.0,
            memory_warning: 85.0,
            memory_critical: 95.0,
            disk_warning: 85.0,
            disk_critical: 95.0,
            warning_digest_every: 5,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// (warning, critical) stuck thresholds for a task with the given timeout.
    pub fn stuck_thresholds(&self, task_timeout_ms: u64) -> (u64, u64) {
        let warning = self.stuck_warning_ms.unwrap_or(task_timeout_ms);
        let critical = self
            .stuck_critical_ms
            .unwrap_or_else(|| warning.saturating_mul(2));
        (warning, critical)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryConfig {
    /// Most recent points always kept by `prune`.
    pub keep_last: usize,
    /// on-error points younger than this are kept as well.
    pub on_error_retention_ms: u64,
    /// Take a `periodic` point every N completed tasks (0 = off).
    pub periodic_every_tasks: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            keep_last: 20,
            on_error_retention_ms: 86_400_000,
            periodic_every_tasks: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Hard wall-clock timeout per attempt, unless the task sets its own.
    pub task_timeout_ms: u64,
    /// Do not wait for an operator: defer escalated tasks and keep going.
    pub unattended: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            task_timeout_ms: 1_800_000,
            unattended: false,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    pub state_dir: PathBuf,
    pub retry: RetryConfig,
    pub circuit: CircuitConfig,
    pub health: HealthConfig,
    pub recovery: RecoveryConfig,
    pub execution: ExecutionConfig,
    /// Error identifier -> class, merged over the built-in table.
    pub classification: BTreeMap<String, ErrorClass>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            retry: RetryConfig::default(),
            circuit: CircuitConfig::default(),
            health: HealthConfig::default(),
            recovery: RecoveryConfig::default(),
            execution: ExecutionConfig::default(),
            classification: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or `keel.toml` in the working directory if it exists, or defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.retry.max_retries_per_task == 0 {
            return invalid("retry.max_retries_per_task must be at least 1");
        }
        if self.retry.max_total_retries == 0 {
            return invalid("retry.max_total_retries must be at least 1");
        }
        if !(self.retry.backoff_factor >= 1.0) {
            return invalid("retry.backoff_factor must be >= 1.0");
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return invalid("retry.max_delay_ms must be >= retry.base_delay_ms");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return invalid("retry.jitter_ratio must be within 0.0..=1.0");
        }
        if self.circuit.failure_threshold == 0 {
            return invalid("circuit.failure_threshold must be at least 1");
        }
        if self.health.interval_ms == 0 {
            return invalid("health.interval_ms must be positive");
        }
        if let (Some(w), Some(c)) = (self.health.stuck_warning_ms, self.health.stuck_critical_ms) {
            if c < w {
                return invalid("health.stuck_critical_ms must be >= health.stuck_warning_ms");
            }
        }
        if self.health.error_rate_critical < self.health.error_rate_warning {
            return invalid("health.error_rate_critical must be >= health.error_rate_warning");
        }
        for (name, w, c) in [
            ("cpu", self.health.cpu_warning, self.health.cpu_critical),
            ("memory", self.health.memory_warning, self.health.memory_critical),
            ("disk", self.health.disk_warning, self.health.disk_critical),
        ] {
            if c < w {
                return Err(ConfigError::Invalid(format!(
                    "health.{name}_critical must be >= health.{name}_warning"
                )));
            }
        }
        if self.health.warning_digest_every == 0 {
            return invalid("health.warning_digest_every must be at least 1");
        }
        if self.recovery.keep_last == 0 {
            return invalid("recovery.keep_last must be at least 1");
        }
        if self.execution.task_timeout_ms == 0 {
            return invalid("execution.task_timeout_ms must be positive");
        }
        Ok(())
    }

    pub fn classifier(&self) -> ErrorClassifier {
        let mut classifier = ErrorClassifier::default();
        classifier.extend(self.classification.iter().map(|(k, v)| (k.as_str(), *v)));
        classifier
    }

    /// Hard timeout of a task: its own, else the configured default.
    pub fn task_timeout(&self, task_timeout_ms: Option<u64>) -> Duration {
        Duration::from_millis(task_timeout_ms.unwrap_or(self.execution.task_timeout_ms))
    }

    pub fn points_dir(&self) -> PathBuf {
        self.state_dir.join(POINTS_DIR)
    }

    pub fn pause_marker(&self) -> PathBuf {
        self.state_dir.join(crate::PAUSE_MARKER)
    }

    pub fn escalation_path(&self) -> PathBuf {
        self.state_dir.join(crate::ESCALATION_FILE)
    }
}
