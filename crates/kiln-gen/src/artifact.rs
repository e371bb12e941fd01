//! The generated artifact type.

use serde::{Deserialize, Serialize};

/// One generated unit of source code plus explanatory metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    /// Complete source text.
    pub code: String,
    /// Human-readable explanation of the change.
    pub explanation: String,
    /// Suggested file name, if the model gave one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl GeneratedArtifact {
    /// Create an artifact with no file name.
    pub fn new(code: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            explanation: explanation.into(),
            filename: None,
        }
    }

    /// Set the file name.
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}
