//! Artifact extraction from free-form model output.
//!
//! The candidate JSON text is chosen in order: the first fenced block
//! (untagged or tagged `json`), else the first balanced `{ ... }` span,
//! else the whole input. The candidate must be an object with a string
//! `code` field.

use crate::artifact::GeneratedArtifact;
use serde_json::{Map, Value};
use thiserror::Error;

/// Explanation used when the model omits one.
pub const DEFAULT_EXPLANATION: &str = "No explanation provided.";

/// Fence marker.
const FENCE: &str = "```";

/// Fence tags treated as structured data.
const JSON_TAGS: &[&str] = &["", "json", "jsonc", "json5"];

/// Why a candidate could not be turned into an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    /// Nothing but whitespace to parse
    #[error("response was empty")]
    Empty,

    /// The candidate is not valid JSON
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// The candidate parsed but is not an object
    #[error("expected a JSON object")]
    NotAnObject,

    /// The object has no string `code` field
    #[error("missing string field \"code\"")]
    MissingCode,
}

/// Try to carve one artifact out of `text`.
pub fn try_extract(text: &str) -> Result<GeneratedArtifact, ExtractError> {
    let candidate = candidate(text).trim();
    if candidate.is_empty() {
        return Err(ExtractError::Empty);
    }

    let value: Value =
        serde_json::from_str(candidate).map_err(|e| ExtractError::InvalidJson(e.to_string()))?;
    let Value::Object(object) = value else {
        return Err(ExtractError::NotAnObject);
    };
    artifact_from_object(object)
}

/// Extract an artifact, falling back to a diagnostic artifact on failure.
///
/// Never fails: the fallback embeds `text` verbatim as its code.
pub fn extract(text: &str) -> GeneratedArtifact {
    try_extract(text).unwrap_or_else(|err| fallback_artifact(text, &err))
}

/// Build the diagnostic artifact for unparseable output.
pub fn fallback_artifact(raw: &str, reason: &ExtractError) -> GeneratedArtifact {
    GeneratedArtifact {
        code: raw.to_string(),
        explanation: format!(
            "Failed to parse the model response as a code artifact ({reason}). \
             The raw response is shown as code instead."
        ),
        filename: None,
    }
}

fn artifact_from_object(mut object: Map<String, Value>) -> Result<GeneratedArtifact, ExtractError> {
    let code = match object.remove("code") {
        Some(Value::String(code)) => code,
        _ => return Err(ExtractError::MissingCode),
    };
    let explanation = match object.remove("explanation") {
        Some(Value::String(explanation)) => explanation,
        _ => DEFAULT_EXPLANATION.to_string(),
    };
    let filename = match object.remove("filename") {
        Some(Value::String(filename)) => Some(filename),
        _ => None,
    };
    Ok(GeneratedArtifact {
        code,
        explanation,
        filename,
    })
}

/// Pick the text to parse.
fn candidate(text: &str) -> &str {
    fenced_block(text)
        .or_else(|| balanced_object(text))
        .unwrap_or(text)
}

/// Inner text of the first complete fenced block with a JSON-ish tag.
fn fenced_block(text: &str) -> Option<&str> {
    let mut search = 0;
    while let Some(offset) = text[search..].find(FENCE) {
        let open = search + offset + FENCE.len();
        let rest = &text[open..];
        let tag_len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
            .unwrap_or(rest.len());
        let tag = &rest[..tag_len];
        let body = &rest[tag_len..];
        let close = body.find(FENCE)?;

        if JSON_TAGS.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            return Some(&body[..close]);
        }
        // Skip the whole non-JSON block.
        search = open + tag_len + close + FENCE.len();
    }
    None
}

/// First `{ ... }` span whose brace depth returns to zero.
///
/// Braces inside JSON string literals are not counted.
fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
