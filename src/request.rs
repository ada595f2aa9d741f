//! Blocking HTTP session with batch dispatch and SSE support.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};

use crate::error::{BridgeError, truncate_body};
use crate::http::reqwest::default_dyn_transport;
use crate::http::{DynHttpTransport, HttpBodyReader, HttpMethod, HttpRequest, HttpResponse, json_body};
use crate::log::{LogLevel, LogRecord, LogSink, SessionLog};
use crate::pool::{MAX_WORKERS, run_bounded};
use crate::stream::SseStream;

/// Timeout applied when neither the session nor the call sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const ERROR_BODY_LIMIT: u64 = 4096;

/// Per-URL outcomes of a batch call. Failures are kept as their description.
pub type BatchResults = HashMap<String, Result<HttpResponse, String>>;

/// Result of [`Request::dispatch`]: one URL yields the response itself.
#[derive(Debug)]
pub enum Dispatch {
    Single(HttpResponse),
    Batch(BatchResults),
}

impl Dispatch {
    /// Returns the single response, if this was a single-URL call.
    pub fn into_single(self) -> Option<HttpResponse> {
        match self {
            Self::Single(response) => Some(response),
            Self::Batch(_) => None,
        }
    }

    pub fn into_batch(self) -> Option<BatchResults> {
        match self {
            Self::Single(_) => None,
            Self::Batch(results) => Some(results),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
}

/// Per-call settings shared by every URL of one dispatch.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: HashMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    /// Overrides the session timeout for this call.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn json(body: Value) -> Self {
        Self {
            body: RequestBody::Json(body),
            ..Self::default()
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A transport session.
///
/// Calls block the caller. With several URLs the calls fan out over at most
/// [`MAX_WORKERS`] threads and every URL gets its own outcome. When logging is enabled
/// each call appends one [`LogRecord`]; `len()` reports how many.
pub struct Request {
    transport: DynHttpTransport,
    timeout: Duration,
    max_workers: usize,
    log: SessionLog,
}

impl Request {
    /// Creates a session over the default reqwest transport.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] when the HTTP client cannot be built.
    pub fn new() -> Result<Self, BridgeError> {
        Ok(Self::with_transport(default_dyn_transport()?))
    }

    pub fn with_transport(transport: DynHttpTransport) -> Self {
        Self {
            transport,
            timeout: DEFAULT_TIMEOUT,
            max_workers: MAX_WORKERS,
            log: SessionLog::new(false),
        }
    }

    /// Sets the session default timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.clamp(1, MAX_WORKERS);
        self
    }

    pub fn enable_logging(mut self, enabled: bool) -> Self {
        self.log.set_enabled(enabled);
        self
    }

    /// Mirrors every log record to `sink`. Has no effect while logging is disabled.
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log.set_sink(sink);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of recorded log entries.
    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn logs(&self) -> Vec<LogRecord> {
        self.log.snapshot()
    }

    pub fn get<U: AsRef<str>>(
        &self,
        urls: &[U],
        options: &RequestOptions,
    ) -> Result<Dispatch, BridgeError> {
        self.dispatch(HttpMethod::Get, urls, options)
    }

    pub fn post<U: AsRef<str>>(
        &self,
        urls: &[U],
        options: &RequestOptions,
    ) -> Result<Dispatch, BridgeError> {
        self.dispatch(HttpMethod::Post, urls, options)
    }

    pub fn put<U: AsRef<str>>(
        &self,
        urls: &[U],
        options: &RequestOptions,
    ) -> Result<Dispatch, BridgeError> {
        self.dispatch(HttpMethod::Put, urls, options)
    }

    pub fn patch<U: AsRef<str>>(
        &self,
        urls: &[U],
        options: &RequestOptions,
    ) -> Result<Dispatch, BridgeError> {
        self.dispatch(HttpMethod::Patch, urls, options)
    }

    pub fn delete<U: AsRef<str>>(
        &self,
        urls: &[U],
        options: &RequestOptions,
    ) -> Result<Dispatch, BridgeError> {
        self.dispatch(HttpMethod::Delete, urls, options)
    }

    /// Sends `method` to every URL in `urls`.
    ///
    /// A single URL is called on the current thread and its failure is returned as an
    /// error. Several URLs are dispatched in parallel and the call always succeeds with
    /// one entry per distinct URL.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Validation`] for an empty URL list, otherwise whatever the
    /// single call failed with.
    pub fn dispatch<U: AsRef<str>>(
        &self,
        method: HttpMethod,
        urls: &[U],
        options: &RequestOptions,
    ) -> Result<Dispatch, BridgeError> {
        match urls {
            [] => Err(BridgeError::validation("at least one URL is required")),
            [url] => self.send(method, url.as_ref(), options).map(Dispatch::Single),
            _ => Ok(Dispatch::Batch(self.send_batch(method, urls, options))),
        }
    }

    /// Performs one blocking call.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] on network or timeout failure. Non-2xx
    /// statuses are returned as responses.
    pub fn send(
        &self,
        method: HttpMethod,
        url: &str,
        options: &RequestOptions,
    ) -> Result<HttpResponse, BridgeError> {
        let result = self
            .build_request(method, url, options)
            .and_then(|request| self.transport.send(request));
        self.record(method, url, result.as_ref().map(|response| response.status));
        result
    }

    /// Calls every URL on the worker pool; a failing URL never affects its siblings.
    pub fn send_batch<U: AsRef<str>>(
        &self,
        method: HttpMethod,
        urls: &[U],
        options: &RequestOptions,
    ) -> BatchResults {
        let jobs: Vec<&str> = urls.iter().map(|url| url.as_ref()).collect();
        run_bounded(jobs, self.max_workers, |url| {
            let outcome = self
                .send(method, url, options)
                .map_err(|err| err.to_string());
            (url.to_string(), outcome)
        })
        .into_iter()
        .collect()
    }

    /// Opens a Server-Sent-Event stream.
    ///
    /// The returned iterator reads the body lazily and ends when the server closes the
    /// connection. Dropping it closes the connection.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] when the connection fails and
    /// [`BridgeError::HttpStatus`] when the server answers with a non-2xx status.
    pub fn request_sse(
        &self,
        method: HttpMethod,
        url: &str,
        options: &RequestOptions,
    ) -> Result<SseStream<HttpBodyReader>, BridgeError> {
        let result = self.build_request(method, url, options).and_then(|mut request| {
            request
                .headers
                .retain(|name, _| !name.eq_ignore_ascii_case("accept"));
            request
                .headers
                .insert("Accept".to_string(), "text/event-stream".to_string());
            self.transport.send_stream(request)
        });
        self.record(method, url, result.as_ref().map(|response| response.status));
        let response = result?;

        if !(200..300).contains(&response.status) {
            let mut body = String::new();
            // unreadable body stays empty
            let _ = response.body.take(ERROR_BODY_LIMIT).read_to_string(&mut body);
            return Err(BridgeError::HttpStatus {
                url: response.url,
                status: response.status,
                body: truncate_body(&body),
            });
        }
        Ok(SseStream::new(response.body, response.url))
    }

    fn build_request(
        &self,
        method: HttpMethod,
        url: &str,
        options: &RequestOptions,
    ) -> Result<HttpRequest, BridgeError> {
        let mut request = HttpRequest::new(method, url)
            .with_timeout(options.timeout.unwrap_or(self.timeout))
            .with_headers(options.headers.clone());
        request.query = options.query.clone();

        let (body, content_type) = match &options.body {
            RequestBody::Empty => (None, None),
            RequestBody::Json(value) => (Some(json_body(value)?), Some("application/json")),
            RequestBody::Text(text) => (Some(text.clone().into_bytes()), Some("text/plain; charset=utf-8")),
            RequestBody::Bytes(bytes) => (Some(bytes.clone()), None),
        };
        if let Some(content_type) = content_type {
            let declared = request
                .headers
                .keys()
                .any(|name| name.eq_ignore_ascii_case("content-type"));
            if !declared {
                request
                    .headers
                    .insert("Content-Type".to_string(), content_type.to_string());
            }
        }
        request.body = body;
        Ok(request)
    }

    fn record(&self, method: HttpMethod, url: &str, outcome: Result<u16, &BridgeError>) {
        let mut context = Map::new();
        context.insert("method".to_string(), json!(method.as_str()));
        context.insert("url".to_string(), json!(url));
        let (level, text) = match outcome {
            Ok(status) => {
                context.insert("outcome".to_string(), json!("completed"));
                context.insert("status".to_string(), json!(status));
                (LogLevel::Info, format!("{method} {url} -> {status}"))
            }
            Err(err) => {
                context.insert("outcome".to_string(), json!("failed"));
                context.insert("error".to_string(), json!(err.to_string()));
                (LogLevel::Error, format!("{method} {url} failed"))
            }
        };
        self.log.push(level, text, context);
    }
}
