//! Canonical request fingerprinting.
//!
//! The fingerprint is the only key used by both the in-memory TTL cache and
//! the persistent cache, so identical requests with differently-ordered
//! parameters MUST produce identical fingerprints.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};

/// A canonicalized `(tool_name, params)` identity. Equality and hashing are
/// defined solely on the fingerprint — never on `tool_name`/`params` directly.
#[derive(Debug, Clone)]
pub struct RequestKey {
    pub tool_name: String,
    pub parameters: Map<String, Value>,
    fingerprint: String,
}

impl RequestKey {
    /// Build a key. Fails if `tool_name` is empty or whitespace-only.
    /// A `None` parameter map is treated as empty.
    pub fn make(tool_name: impl Into<String>, params: Option<Map<String, Value>>) -> Result<Self> {
        let tool_name = tool_name.into();
        if tool_name.trim().is_empty() {
            return Err(CoreError::InvalidInput(
                "tool_name must not be empty".into(),
            ));
        }
        let parameters = params.unwrap_or_default();
        let fingerprint = fingerprint_of(&tool_name, &parameters);
        Ok(Self {
            tool_name,
            parameters,
            fingerprint,
        })
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl PartialEq for RequestKey {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}
impl Eq for RequestKey {}

impl std::hash::Hash for RequestKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state);
    }
}

/// Sort object keys by codepoint order, recursively, so the serialized form
/// is independent of insertion order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let canon: Map<String, Value> = entries
                .into_iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            Value::Object(canon)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// `hex(sha256(tool_name || 0x00 || JSON(sorted(params))))`.
fn fingerprint_of(tool_name: &str, params: &Map<String, Value>) -> String {
    let canonical = canonicalize(&Value::Object(params.clone()));
    let json = serde_json::to_string(&canonical).unwrap_or_else(|_| "{}".to_string());

    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(json.as_bytes());
    hex::encode(hasher.finalize())
}
