//! Artifacts produced by phase executors.

use serde::{Deserialize, Serialize};

/// One named output of a phase, optionally bound for a file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub content: String,
}

impl Artifact {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            content: content.into(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Name used for merge and deliverable matching: lowercase, trimmed.
    pub fn key(&self) -> String {
        self.name.trim().to_lowercase()
    }
}
