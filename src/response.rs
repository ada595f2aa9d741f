//! Provider response extraction.
//!
//! Responses are decoded JSON of arbitrary shape. Each provider declares extraction
//! paths in the argument table; this module walks them and builds a uniform
//! [`ResponseEnvelope`]. Unresolvable paths degrade to `None`, never to errors.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BridgeError;
use crate::schema::{MetadataPaths, OutputPaths, PathSpec, SchemaStore};

/// Keys skipped when looking for text inside a mapping without content keys.
pub const METADATA_FIELDS: [&str; 8] = [
    "role",
    "index",
    "finish_reason",
    "object",
    "id",
    "created",
    "model",
    "logprobs",
];

/// Keys that hold text when no provider override is configured.
pub const DEFAULT_CONTENT_KEYS: [&str; 3] = ["content", "text", "refusal"];

const DEFAULT_TEXT_JOIN: &str = "\n";

/// Outcome of resolving one extraction path.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Some segment could not be resolved.
    Missing,
    /// The path led to a single value.
    Found(Value),
    /// A `*` segment fanned out; holds every non-null result, flattened.
    Broadcast(Vec<Value>),
}

impl Resolution {
    /// Collapses the resolution into an optional value. `null` counts as missing.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Missing | Self::Found(Value::Null) => None,
            Self::Found(value) => Some(value),
            Self::Broadcast(values) => Some(Value::Array(values)),
        }
    }
}

/// Resolves a `/`-separated path against `data`.
///
/// Numeric segments index arrays, other segments look up object keys. A `*` segment
/// applies the rest of the path to every element of the current array; `*key` does the
/// same for the array stored under `key`. A trailing `*` yields the array itself.
pub fn resolve_path(data: &Value, path: &str) -> Resolution {
    let segments: Vec<&str> = path.split('/').filter(|segment| !segment.is_empty()).collect();
    if segments.is_empty() {
        return Resolution::Missing;
    }
    resolve_segments(data, &segments)
}

fn resolve_segments(current: &Value, segments: &[&str]) -> Resolution {
    let Some((head, rest)) = segments.split_first() else {
        return Resolution::Found(current.clone());
    };

    if let Some(key) = head.strip_prefix('*') {
        let target = if key.is_empty() { Some(current) } else { current.get(key) };
        let Some(Value::Array(items)) = target else {
            return Resolution::Missing;
        };
        if rest.is_empty() {
            return Resolution::Found(Value::Array(items.clone()));
        }
        let mut collected = Vec::new();
        for item in items {
            match resolve_segments(item, rest) {
                Resolution::Missing | Resolution::Found(Value::Null) => {}
                Resolution::Found(value) => collected.push(value),
                Resolution::Broadcast(values) => collected.extend(values),
            }
        }
        return Resolution::Broadcast(collected);
    }

    let next = match current {
        Value::Object(map) => map.get(*head),
        Value::Array(items) => head.parse::<usize>().ok().and_then(|idx| items.get(idx)),
        _ => None,
    };
    match next {
        Some(value) => resolve_segments(value, rest),
        None => Resolution::Missing,
    }
}

/// Resolves `path` against `data`, returning `None` when any segment is unresolvable.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use llm_bridge::response::get_nested_value;
///
/// let data = json!({"a": {"b": [{"c": 1}, {"c": 2}]}});
/// assert_eq!(get_nested_value(&data, "a/b/*/c"), Some(json!([1, 2])));
/// assert_eq!(get_nested_value(&json!({"a": 1}), "a/b/c"), None);
/// ```
pub fn get_nested_value(data: &Value, path: &str) -> Option<Value> {
    resolve_path(data, path).into_value()
}

/// Collects text fragments below `value` in document order.
///
/// Every non-empty string is emitted, whitespace included. Inside a mapping, values under `content_keys` are
/// visited; a mapping with none of those keys is visited through every value except
/// [`METADATA_FIELDS`].
pub fn deep_extract_text<S: AsRef<str>>(value: &Value, content_keys: &[S]) -> Vec<String> {
    let mut fragments = Vec::new();
    collect_text(value, content_keys, &mut fragments);
    fragments
}

fn collect_text<S: AsRef<str>>(value: &Value, content_keys: &[S], out: &mut Vec<String>) {
    match value {
        Value::String(text) => {
            if !text.is_empty() {
                out.push(text.clone());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_text(item, content_keys, out);
            }
        }
        Value::Object(map) => {
            let is_content_key = |key: &str| content_keys.iter().any(|k| k.as_ref() == key);
            if map.keys().any(|key| is_content_key(key)) {
                for (key, child) in map {
                    if is_content_key(key) {
                        collect_text(child, content_keys, out);
                    }
                }
            } else {
                for (key, child) in map {
                    if !METADATA_FIELDS.contains(&key.as_str()) {
                        collect_text(child, content_keys, out);
                    }
                }
            }
        }
        _ => {}
    }
}

/// Uniform view over any provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub response_text: Option<String>,
    pub response_usage: Option<Value>,
    pub response_information: Option<Value>,
    /// The response exactly as received.
    pub raw_response: Value,
}

/// Unwraps provider responses using the extraction paths of a [`SchemaStore`].
#[derive(Debug, Clone)]
pub struct ResponseUnwrap {
    store: Arc<SchemaStore>,
}

impl ResponseUnwrap {
    pub fn new(store: Arc<SchemaStore>) -> Self {
        Self { store }
    }

    /// Uses the process-wide store.
    pub fn global() -> Result<Self, BridgeError> {
        SchemaStore::global().map(Self::new)
    }

    /// Extracts text, usage and metadata from `response`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::UnsupportedProvider`] for unknown providers. Paths that do
    /// not resolve yield `None` fields instead of errors.
    pub fn unwrap(&self, provider: &str, response: Value) -> Result<ResponseEnvelope, BridgeError> {
        let schema = self.store.provider(provider)?;
        let output = schema.output_for(&response);

        let response_text = output.text.as_ref().and_then(|spec| extract_text(&response, spec, output));
        let response_usage = output.usage.as_ref().and_then(|spec| first_resolved(&response, spec));
        let response_information = output
            .metadata
            .as_ref()
            .and_then(|metadata| extract_metadata(&response, metadata));

        Ok(ResponseEnvelope {
            response_text,
            response_usage,
            response_information,
            raw_response: response,
        })
    }
}

fn extract_text(response: &Value, spec: &PathSpec, output: &OutputPaths) -> Option<String> {
    let mut fragments = Vec::new();
    for path in spec.paths() {
        if let Some(found) = get_nested_value(response, path) {
            match &output.content_keys {
                Some(keys) => collect_text(&found, keys.as_slice(), &mut fragments),
                None => collect_text(&found, &DEFAULT_CONTENT_KEYS, &mut fragments),
            }
        }
    }
    if fragments.is_empty() {
        return None;
    }
    let separator = output.text_join.as_deref().unwrap_or(DEFAULT_TEXT_JOIN);
    Some(fragments.join(separator))
}

fn first_resolved(response: &Value, spec: &PathSpec) -> Option<Value> {
    spec.paths().find_map(|path| get_nested_value(response, path))
}

fn extract_metadata(response: &Value, metadata: &MetadataPaths) -> Option<Value> {
    match metadata {
        MetadataPaths::Path(spec) => first_resolved(response, spec),
        MetadataPaths::Named(fields) => {
            let resolved: Map<String, Value> = fields
                .iter()
                .map(|(name, path)| {
                    let value = get_nested_value(response, path).unwrap_or(Value::Null);
                    (name.clone(), value)
                })
                .collect();
            Some(Value::Object(resolved))
        }
    }
}
