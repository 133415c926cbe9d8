//! Cache fingerprints: a deterministic hash over a configurable projection
//! of the request body.
//!
//! The projection either keeps only the configured `include_fields` or
//! drops the configured `exclude_fields` (defaults drop noisy, non-semantic
//! fields like request IDs and client metadata). Object keys are sorted
//! before hashing so serialization order cannot split the cache.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Field projection applied to request bodies before hashing.
#[derive(Debug, Clone)]
pub struct Projection {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl Projection {
    /// `include` wins when non-empty; otherwise everything except
    /// `exclude` participates.
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        Self { include, exclude }
    }

    /// Apply the projection to a top-level request body.
    pub fn project(&self, body: &Value) -> Value {
        let Value::Object(map) = body else {
            return body.clone();
        };
        let keep = |key: &str| {
            if self.include.is_empty() {
                !self.exclude.iter().any(|f| f == key)
            } else {
                self.include.iter().any(|f| f == key)
            }
        };
        Value::Object(
            map.iter()
                .filter(|(key, _)| keep(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        )
    }
}

/// Recursively sort object keys so logically equal bodies hash equally.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by_key(|(key, _)| key.as_str());
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(key, value)| (key.clone(), canonicalize(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compute the fingerprint of a projected body.
pub fn fingerprint(projection: &Projection, body: &Value) -> String {
    let projected = canonicalize(&projection.project(body));
    let mut hasher = Sha256::new();
    // Canonicalized values serialize deterministically.
    hasher.update(projected.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Concatenated text content of a request body's messages, used as the
/// similarity corpus.
pub fn message_text(body: &Value) -> String {
    let mut out = String::new();
    let Some(messages) = body.get("messages").and_then(|m| m.as_array()) else {
        return out;
    };
    for message in messages {
        match message.get("content") {
            Some(Value::String(text)) => {
                out.push_str(text);
                out.push('\n');
            }
            Some(Value::Array(blocks)) => {
                for block in blocks {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        out.push_str(text);
                        out.push('\n');
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// Normalized token-set Jaccard similarity in `[0, 1]`.
///
/// Tokens are lowercased whitespace splits; identical sets score 1.0 and
/// disjoint sets 0.0. Two empty inputs count as identical.
pub fn similarity(a: &str, b: &str) -> f64 {
    let set = |s: &str| {
        s.split_whitespace()
            .map(|t| t.to_lowercase())
            .collect::<std::collections::HashSet<_>>()
    };
    let a = set(a);
    let b = set(b);
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(&b).count();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}
