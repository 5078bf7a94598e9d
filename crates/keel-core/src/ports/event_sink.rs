//! EventSink port - 判断と health event の記録
//!
//! 記録の失敗は tracing に出すだけで、実行は止めない。

use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::{DecisionRecord, HealthEvent};

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Append to the decision journal ("why did the system do X").
    async fn decision(&self, record: &DecisionRecord);

    /// Append to the health event log.
    async fn health(&self, event: &HealthEvent);
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn decision(&self, _record: &DecisionRecord) {}
    async fn health(&self, _event: &HealthEvent) {}
}

/// Keeps events in memory for assertions.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    decisions: Mutex<Vec<DecisionRecord>>,
    health: Mutex<Vec<HealthEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decisions(&self) -> Vec<DecisionRecord> {
        match self.decisions.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn health_events(&self) -> Vec<HealthEvent> {
        match self.health.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn decision(&self, record: &DecisionRecord) {
        if let Ok(mut guard) = self.decisions.lock() {
            guard.push(record.clone());
        }
    }

    async fn health(&self, event: &HealthEvent) {
        if let Ok(mut guard) = self.health.lock() {
            guard.push(event.clone());
        }
    }
}
