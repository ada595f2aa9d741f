use thiserror::Error;

/// Aggregates every failure mode exposed by the bridge.
///
/// Normalization failures (`UnsupportedProvider`, `MissingArgument`, `TypeMismatch`) are
/// raised synchronously by [`crate::convert::Converter`]. Transport failures surface per
/// call, and are captured as strings per URL in batch mode.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The provider name is absent from the merged schema tables.
    #[error("unsupported provider: \"{provider}\"")]
    UnsupportedProvider { provider: String },
    /// A globally or provider-essential argument was not supplied.
    #[error("missing essential arg '{field}' for provider {provider}")]
    MissingArgument { field: String, provider: String },
    /// A value failed its declared type expression.
    #[error("type of arg '{field}' mismatch for {provider}: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Provider-specific field name after renaming.
        field: String,
        provider: String,
        /// The declared type expression, rendered back to text.
        expected: String,
        /// Runtime type tag of the offending value.
        actual: &'static str,
    },
    /// Merged configuration tables are internally inconsistent.
    ///
    /// The schema store recovers from this locally by falling back to the system tables,
    /// so callers only observe it when validating tables explicitly.
    #[error("configuration validation failed: {reason}")]
    ConfigValidation { reason: String },
    /// A configuration file could not be read or parsed.
    #[error("invalid configuration file {path}: {message}")]
    Config { path: String, message: String },
    /// Network, timeout or protocol failure while talking to `url`.
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },
    /// The server rejected a call that requires a successful status (SSE handshake).
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        url: String,
        status: u16,
        /// Response body, truncated for readability.
        body: String,
    },
    /// Malformed Server-Sent-Event framing.
    #[error("stream decode error: {message}")]
    StreamDecode { message: String },
    /// Caller misuse, such as dispatching with no URL at all.
    #[error("invalid request: {message}")]
    Validation { message: String },
}

impl BridgeError {
    /// Creates a [`BridgeError::Transport`] for the given URL.
    ///
    /// # Examples
    ///
    /// ```
    /// use llm_bridge::error::BridgeError;
    ///
    /// let err = BridgeError::transport("http://localhost:1", "connection refused");
    /// assert!(matches!(err, BridgeError::Transport { .. }));
    /// assert!(err.to_string().contains("localhost:1"));
    /// ```
    pub fn transport<U: Into<String>, M: Into<String>>(url: U, message: M) -> Self {
        Self::Transport {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates a [`BridgeError::MissingArgument`] naming the absent field.
    pub fn missing<F: Into<String>, P: Into<String>>(field: F, provider: P) -> Self {
        Self::MissingArgument {
            field: field.into(),
            provider: provider.into(),
        }
    }

    /// Creates a [`BridgeError::UnsupportedProvider`].
    pub fn unsupported<P: Into<String>>(provider: P) -> Self {
        Self::UnsupportedProvider {
            provider: provider.into(),
        }
    }

    /// Creates a [`BridgeError::Validation`] from a textual description.
    pub fn validation<T: Into<String>>(message: T) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// Shortens a response body so it can be embedded in an error message.
pub(crate) fn truncate_body(body: &str) -> String {
    const LIMIT: usize = 512;
    if body.len() <= LIMIT {
        return body.to_string();
    }
    let mut end = LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
