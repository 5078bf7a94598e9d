//! Task plan: the ordered task list handed to the engine.
//!
//! Accepted as TOML or JSON:
//!
//! ```toml
//! [[tasks]]
//! id = "fetch"
//! operation = "github-api"
//! payload = { command = ["./fetch.sh"] }
//!
//! [[tasks]]
//! id = "build"
//! depends_on = ["fetch"]
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::task::TaskSpec;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("failed to read plan {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid TOML plan: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid JSON plan: {0}")]
    Json(#[from] serde_json::Error),
}

/// Ordered list of task definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl Plan {
    pub fn new(tasks: Vec<TaskSpec>) -> Self {
        Self { tasks }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, PlanError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self, PlanError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Read a plan file; `.json` is parsed as JSON, anything else as TOML.
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let text = std::fs::read_to_string(path).map_err(|source| PlanError::Io {
            path: path.display().to_string(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_toml_str(&text),
        }
    }
}
