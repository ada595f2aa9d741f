use serde_json::{Map, Value};

use crate::error::BridgeError;
use crate::schema::SchemaStore;
use crate::validate::{TypeExpr, parse_types, value_type_name};

/// Generic arguments renamed and validated for one provider.
///
/// A converter is built per outbound call. Construction is pure: identical inputs always
/// produce the same payload or the same error.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use llm_bridge::convert::Converter;
///
/// let converter = Converter::from_json(
///     "openai",
///     json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "Hello"}]}),
/// )
/// .unwrap();
/// assert_eq!(converter.provider(), "openai");
/// assert_eq!(converter.information()["model"], json!("gpt-4o-mini"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Converter {
    provider: String,
    information: Map<String, Value>,
    stream: bool,
}

impl Converter {
    /// Normalizes `kwargs` for `provider` against the process-wide [`SchemaStore`].
    pub fn new(provider: &str, kwargs: Map<String, Value>) -> Result<Self, BridgeError> {
        let store = SchemaStore::global()?;
        Self::with_store(&store, provider, kwargs)
    }

    /// Same as [`Converter::new`] for a JSON object literal.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Validation`] when `kwargs` is not an object.
    pub fn from_json(provider: &str, kwargs: Value) -> Result<Self, BridgeError> {
        match kwargs {
            Value::Object(map) => Self::new(provider, map),
            other => Err(BridgeError::validation(format!(
                "generic arguments must be an object, got {}",
                value_type_name(&other)
            ))),
        }
    }

    /// Normalizes `kwargs` for `provider` against an explicit store.
    ///
    /// # Errors
    ///
    /// * [`BridgeError::UnsupportedProvider`] when the store does not know `provider`;
    /// * [`BridgeError::MissingArgument`] when a global or provider-essential field is
    ///   absent from `kwargs`;
    /// * [`BridgeError::TypeMismatch`] when a renamed value fails its declared type.
    pub fn with_store(
        store: &SchemaStore,
        provider: &str,
        kwargs: Map<String, Value>,
    ) -> Result<Self, BridgeError> {
        let schema = store.provider(provider)?;

        if let Some(field) = store
            .essential_args()
            .iter()
            .chain(&schema.essential)
            .find(|field| !kwargs.contains_key(field.as_str()))
        {
            return Err(BridgeError::missing(field.as_str(), provider));
        }

        let mut generic = kwargs;
        for (key, value) in &schema.defaults {
            if !generic.contains_key(key) {
                generic.insert(key.clone(), value.clone());
            }
        }
        let stream = generic.get("stream").and_then(Value::as_bool).unwrap_or(false);

        let mut information = Map::new();
        for (key, value) in generic {
            let target = match schema.input.get(&key) {
                Some(target) if target.is_empty() => {
                    tracing::debug!(provider, field = %key, "dropping argument the provider does not accept");
                    continue;
                }
                Some(target) => target.clone(),
                None => key,
            };

            if let Some(expr) = schema.input_types.get(&target) {
                match parse_types(expr, &value) {
                    Some(false) => {
                        return Err(BridgeError::TypeMismatch {
                            expected: render_expr(expr),
                            actual: value_type_name(&value),
                            field: target,
                            provider: provider.to_string(),
                        });
                    }
                    None => {
                        tracing::debug!(provider, field = %target, "type expression not recognized, skipping validation");
                    }
                    Some(true) => {}
                }
            }
            information.insert(target, value);
        }

        Ok(Self {
            provider: provider.to_string(),
            information,
            stream,
        })
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Provider-specific payload fields.
    pub fn information(&self) -> &Map<String, Value> {
        &self.information
    }

    /// Whether the caller asked for a streamed response.
    pub fn is_stream(&self) -> bool {
        self.stream
    }

    /// Consumes the converter and returns the payload as a JSON object.
    pub fn into_payload(self) -> Value {
        Value::Object(self.information)
    }
}

fn render_expr(expr: &Value) -> String {
    TypeExpr::parse(expr)
        .map(|parsed| parsed.to_string())
        .unwrap_or_else(|| expr.to_string())
}
