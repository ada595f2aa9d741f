use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::BridgeError;

pub mod headers;
pub mod reqwest;

/// Enumerates HTTP methods understood by the transport abstraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimal HTTP request representation.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Deadline for [`HttpTransport::send`]. For [`HttpTransport::send_stream`] it bounds
    /// the wait for the response head and every wait for more body data.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    /// Builds a request without headers or body.
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            query: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// Builds a POST request with a JSON request body.
    ///
    /// The helper sets the `Content-Type` header to `application/json` and stores the
    /// provided buffer as the body.
    ///
    /// # Examples
    ///
    /// ```
    /// use llm_bridge::http::{HttpMethod, HttpRequest};
    ///
    /// let request = HttpRequest::post_json("https://example.com", br"{}".to_vec());
    /// assert_eq!(request.method, HttpMethod::Post);
    /// assert_eq!(request.headers.get("Content-Type"), Some(&"application/json".to_string()));
    /// ```
    pub fn post_json(url: impl Into<String>, body: Vec<u8>) -> Self {
        let mut request = Self::new(HttpMethod::Post, url);
        request
            .headers
            .insert("Content-Type".to_string(), "application/json".to_string());
        request.body = Some(body);
        request
    }

    /// Merges `headers` into the request, replacing same-named entries.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::collections::HashMap;
    /// use llm_bridge::http::HttpRequest;
    ///
    /// let request = HttpRequest::post_json("https://example.com", br"{}".to_vec())
    ///     .with_headers(HashMap::from([("Authorization".into(), "Bearer test".into())]));
    /// assert_eq!(request.headers.get("Authorization"), Some(&"Bearer test".to_string()));
    /// assert_eq!(request.headers.len(), 2);
    /// ```
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Minimal HTTP response representation.
///
/// Non-2xx statuses are still responses; check [`HttpResponse::is_success`].
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// URL the request was sent to.
    pub url: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Returns the body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Converts the body into a UTF-8 string.
    ///
    /// # Examples
    ///
    /// ```
    /// use llm_bridge::http::HttpResponse;
    ///
    /// let response = HttpResponse {
    ///     url: "http://localhost".into(),
    ///     status: 200,
    ///     headers: Default::default(),
    ///     body: b"ok".to_vec(),
    /// };
    /// assert_eq!(response.into_string().unwrap(), "ok");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] when the body is not valid UTF-8.
    pub fn into_string(self) -> Result<String, BridgeError> {
        let url = self.url;
        String::from_utf8(self.body).map_err(|err| BridgeError::transport(url, err.to_string()))
    }

    /// Decodes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] when the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, BridgeError> {
        serde_json::from_slice(&self.body).map_err(|err| {
            BridgeError::transport(&self.url, format!("failed to decode JSON body: {err}"))
        })
    }

    /// Looks up a header case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Alias for the body reader returned by [`HttpTransport::send_stream`].
pub type HttpBodyReader = Box<dyn Read + Send>;

/// HTTP response whose body is read incrementally.
pub struct HttpStreamResponse {
    pub url: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: HttpBodyReader,
}

impl fmt::Debug for HttpStreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStreamResponse")
            .field("url", &self.url)
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Blocking transport abstraction, decoupling the bridge from the concrete HTTP client.
///
/// # Examples
///
/// ```
/// use llm_bridge::error::BridgeError;
/// use llm_bridge::http::{HttpRequest, HttpResponse, HttpStreamResponse, HttpTransport};
///
/// struct MemoryTransport;
///
/// impl HttpTransport for MemoryTransport {
///     fn send(&self, request: HttpRequest) -> Result<HttpResponse, BridgeError> {
///         Ok(HttpResponse { url: request.url, status: 200, headers: request.headers, body: b"ok".to_vec() })
///     }
///     fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, BridgeError> {
///         Ok(HttpStreamResponse {
///             url: request.url,
///             status: 200,
///             headers: request.headers,
///             body: Box::new(std::io::Cursor::new(b"data: hi\n\n".to_vec())),
///         })
///     }
/// }
///
/// let response = MemoryTransport
///     .send(HttpRequest::post_json("https://example.com", br"{}".to_vec()))
///     .unwrap();
/// assert_eq!(response.status, 200);
/// ```
pub trait HttpTransport: Send + Sync {
    /// Sends a request and blocks until the full response is available.
    ///
    /// # Errors
    ///
    /// Implementations map network and timeout failures to [`BridgeError::Transport`].
    fn send(&self, request: HttpRequest) -> Result<HttpResponse, BridgeError>;

    /// Sends a request and returns as soon as the response head is available.
    ///
    /// The request timeout is an idle timeout here: a stream may run indefinitely as long
    /// as data keeps arriving.
    ///
    /// # Errors
    ///
    /// Implementations map network and timeout failures to [`BridgeError::Transport`].
    fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, BridgeError>;
}

/// Thread-safe handle to a transport implementation.
pub type DynHttpTransport = Arc<dyn HttpTransport>;

/// Serializes `body` to JSON bytes.
///
/// # Errors
///
/// Returns [`BridgeError::Validation`] when serialization fails.
pub fn json_body<T: Serialize + ?Sized>(body: &T) -> Result<Vec<u8>, BridgeError> {
    serde_json::to_vec(body)
        .map_err(|err| BridgeError::validation(format!("failed to serialize request: {err}")))
}
