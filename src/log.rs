//! Session log kept by [`crate::request::Request`].
//!
//! Every dispatched call appends a [`LogRecord`] when logging is enabled. Records are
//! mirrored to `tracing` and to an optional external [`LogSink`]. Logging never fails
//! the request path.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub text: String,
    /// Structured fields such as `method`, `url` and `outcome`.
    pub context: Map<String, Value>,
}

/// External structured-logging collaborator.
pub trait LogSink: Send + Sync {
    fn record(&self, level: LogLevel, text: &str, context: &Map<String, Value>);
}

#[derive(Default)]
pub(crate) struct SessionLog {
    enabled: bool,
    records: Mutex<Vec<LogRecord>>,
    sink: Option<Arc<dyn LogSink>>,
}

impl SessionLog {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub(crate) fn set_sink(&mut self, sink: Arc<dyn LogSink>) {
        self.sink = Some(sink);
    }

    pub(crate) fn push(&self, level: LogLevel, text: String, context: Map<String, Value>) {
        if !self.enabled {
            return;
        }
        match level {
            LogLevel::Debug => tracing::debug!(?context, "{text}"),
            LogLevel::Info => tracing::info!(?context, "{text}"),
            LogLevel::Warn => tracing::warn!(?context, "{text}"),
            LogLevel::Error => tracing::error!(?context, "{text}"),
        }
        if let Some(sink) = &self.sink {
            sink.record(level, &text, &context);
        }
        // a poisoned lock drops the record
        if let Ok(mut records) = self.records.lock() {
            records.push(LogRecord {
                timestamp: Local::now(),
                level,
                text,
                context,
            });
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub(crate) fn snapshot(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}
