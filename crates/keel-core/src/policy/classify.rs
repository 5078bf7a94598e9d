//! Error classification table: executor error identifier -> ErrorClass.

use std::collections::HashMap;

use crate::domain::ErrorClass;
use crate::domain::errors::ids;

const TRANSIENT: &[&str] = &[
    "network",
    "rate_limit",
    ids::TIMEOUT,
    "connection_reset",
    "unavailable",
    ids::CIRCUIT_OPEN,
    ids::EXECUTOR_ERROR,
];
const PERMANENT: &[&str] = &["validation", "authorization", "malformed_task", "not_found"];
const RESOURCE: &[&str] = &["disk_full", "out_of_memory"];
const CORRUPTION: &[&str] = &["state_corruption"];

/// Maps error identifiers to classes.
///
/// Extensible: configuration entries are merged over the built-in table.
/// Identifiers are matched case-insensitively; unknown ones get `fallback`.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    table: HashMap<String, ErrorClass>,
    fallback: ErrorClass,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        let mut table = HashMap::new();
        for (ids, class) in [
            (TRANSIENT, ErrorClass::Transient),
            (PERMANENT, ErrorClass::Permanent),
            (RESOURCE, ErrorClass::Resource),
            (CORRUPTION, ErrorClass::StateCorruption),
        ] {
            for id in ids {
                table.insert((*id).to_string(), class);
            }
        }
        Self {
            table,
            fallback: ErrorClass::Transient,
        }
    }
}

impl ErrorClassifier {
    pub fn empty(fallback: ErrorClass) -> Self {
        Self {
            table: HashMap::new(),
            fallback,
        }
    }

    pub fn with(mut self, error_id: impl AsRef<str>, class: ErrorClass) -> Self {
        self.insert(error_id, class);
        self
    }

    pub fn insert(&mut self, error_id: impl AsRef<str>, class: ErrorClass) {
        self.table
            .insert(error_id.as_ref().to_ascii_lowercase(), class);
    }

    /// Merge entries over the current table.
    pub fn extend<I, S>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (S, ErrorClass)>,
        S: AsRef<str>,
    {
        for (id, class) in entries {
            self.insert(id, class);
        }
    }

    pub fn with_fallback(mut self, fallback: ErrorClass) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn classify(&self, error_id: &str) -> ErrorClass {
        self.table
            .get(&error_id.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.fallback)
    }

    pub fn is_known(&self, error_id: &str) -> bool {
        self.table.contains_key(&error_id.to_ascii_lowercase())
    }
}
