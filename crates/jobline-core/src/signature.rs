use std::fmt;

use serde_json::Value;

use crate::types::{ApiRequest, Method};

/// Deterministic key derived from method, endpoint and body.
///
/// Object keys are emitted in sorted order at every depth, so bodies that are
/// logically identical produce identical signatures regardless of how they
/// were built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestSignature(String);

impl RequestSignature {
    /// Signature for a call; `None` and an absent body are the same key.
    pub fn new(method: Method, endpoint: &str, body: Option<&Value>) -> Self {
        let mut key = format!("{method}:{endpoint}:");
        if let Some(body) = body {
            write_canonical(body, &mut key);
        }
        Self(key)
    }

    /// Signature of an already-built request.
    pub fn of(request: &ApiRequest) -> Self {
        Self::new(request.method, &request.endpoint, request.body.as_ref())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (idx, (key, value)) in entries.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
