//! JSONL event sink: `journal.jsonl` (decisions) and `health.jsonl`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use super::atomic::append_line;
use crate::domain::{DecisionRecord, HealthEvent};
use crate::ports::EventSink;

pub const JOURNAL_FILE: &str = "journal.jsonl";
pub const HEALTH_FILE: &str = "health.jsonl";

#[derive(Debug, Clone)]
pub struct JsonlEventSink {
    journal: PathBuf,
    health: PathBuf,
}

impl JsonlEventSink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            journal: dir.join(JOURNAL_FILE),
            health: dir.join(HEALTH_FILE),
        }
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal
    }

    pub fn health_path(&self) -> &Path {
        &self.health
    }

    async fn append<T: Serialize + Sync>(path: &Path, value: &T) {
        let line = match serde_json::to_string(value) {
            Ok(line) => line,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to encode journal entry");
                return;
            }
        };
        if let Err(e) = append_line(path, &line).await {
            warn!(path = %path.display(), error = %e, "failed to append journal entry");
        }
    }
}

#[async_trait]
impl EventSink for JsonlEventSink {
    async fn decision(&self, record: &DecisionRecord) {
        Self::append(&self.journal, record).await;
    }

    async fn health(&self, event: &HealthEvent) {
        Self::append(&self.health, event).await;
    }
}

/// Read a JSONL file written by this sink, skipping lines that do not parse.
pub async fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> std::io::Result<Vec<T>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Severity, TaskId};
    use chrono::Utc;

    #[tokio::test]
    async fn decisions_and_health_go_to_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlEventSink::new(dir.path());

        let record = DecisionRecord::new(
            Utc::now(),
            Some(TaskId::new("a")),
            serde_json::json!({"error_id": "network"}),
            "retry_controller",
            "schedule_retry",
        );
        sink.decision(&record).await;
        sink.decision(&record).await;
        sink.health(&HealthEvent::new(Utc::now(), "cpu_percent", 91.0, 90.0, Severity::Warning, "busy"))
            .await;

        let decisions: Vec<DecisionRecord> = read_jsonl(sink.journal_path()).await.unwrap();
        let health: Vec<HealthEvent> = read_jsonl(sink.health_path()).await.unwrap();
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].decision, "schedule_retry");
        assert_eq!(health.len(), 1);
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let entries: Vec<DecisionRecord> = read_jsonl(&dir.path().join("none.jsonl")).await.unwrap();
        assert!(entries.is_empty());
    }
}
