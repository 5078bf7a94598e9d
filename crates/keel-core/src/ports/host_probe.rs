//! HostProbe port: host resource usage for the health monitor.

use std::sync::Mutex;

use async_trait::async_trait;

/// Usage percentages (0-100). `None` when a figure is not available.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostSample {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
}

#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn sample(&self) -> HostSample;
}

/// Probe returning whatever was last `set`. For tests and hosts without /proc.
#[derive(Debug, Default)]
pub struct StaticProbe {
    sample: Mutex<HostSample>,
}

impl StaticProbe {
    pub fn new(sample: HostSample) -> Self {
        Self {
            sample: Mutex::new(sample),
        }
    }

    pub fn set(&self, sample: HostSample) {
        match self.sample.lock() {
            Ok(mut guard) => *guard = sample,
            Err(poisoned) => *poisoned.into_inner() = sample,
        }
    }
}

#[async_trait]
impl HostProbe for StaticProbe {
    async fn sample(&self) -> HostSample {
        match self.sample.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
