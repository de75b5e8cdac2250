//! Logger port consumed by the server and its middleware.
//!
//! # Responsibilities
//! - Define the leveled, context-aware logging interface (`Logger`)
//! - Carry request metadata (`ContextMeta`) into every record
//! - Provide the default `tracing` adapter and an in-memory recorder
//!
//! # Design Decisions
//! - The logger is injected at construction, never looked up globally
//! - Implementations must be safe for concurrent use (`Send + Sync`)
//! - Field values are JSON values so sinks can stay structured

use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tracing::Level;

/// Shared handle to a logger implementation.
pub type SharedLogger = Arc<dyn Logger>;

/// A single structured key/value pair attached to a log record.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub key: &'static str,
    pub value: Value,
}

/// Build a [`Field`] from anything convertible into a JSON value.
pub fn field(key: &'static str, value: impl Into<Value>) -> Field {
    Field {
        key,
        value: value.into(),
    }
}

/// Request-scoped metadata bound once per request.
///
/// Every record emitted while handling the request carries these fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextMeta {
    pub trace_id: String,
    pub user_ip: Option<IpAddr>,
    pub path: String,
    pub user_agent: String,
    pub method: String,
}

/// Leveled, structured logger.
///
/// Only [`Logger::log`] is required; the level helpers forward to it.
pub trait Logger: Send + Sync + 'static {
    /// Emit one record.
    fn log(&self, level: Level, meta: Option<&ContextMeta>, message: &str, fields: &[Field]);

    fn info(&self, meta: Option<&ContextMeta>, message: &str, fields: &[Field]) {
        self.log(Level::INFO, meta, message, fields);
    }

    fn warn(&self, meta: Option<&ContextMeta>, message: &str, fields: &[Field]) {
        self.log(Level::WARN, meta, message, fields);
    }

    fn error(&self, meta: Option<&ContextMeta>, message: &str, fields: &[Field]) {
        self.log(Level::ERROR, meta, message, fields);
    }

    /// Flush buffered records. Called once by the entry point after shutdown.
    fn flush(&self) {}
}

/// Logger that forwards records to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl TracingLogger {
    pub fn new() -> Self {
        Self
    }
}

/// Renders fields as a JSON object so the subscriber keeps them structured.
struct FieldsDisplay<'a>(&'a [Field]);

impl fmt::Display for FieldsDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map: serde_json::Map<String, Value> = self
            .0
            .iter()
            .map(|fld| (fld.key.to_string(), fld.value.clone()))
            .collect();
        write!(f, "{}", Value::Object(map))
    }
}

macro_rules! emit {
    ($level:expr, $meta:expr, $message:expr, $fields:expr) => {
        match $meta {
            Some(meta) => tracing::event!(
                $level,
                trace_id = %meta.trace_id,
                user_ip = ?meta.user_ip,
                path = %meta.path,
                user_agent = %meta.user_agent,
                method = %meta.method,
                fields = %FieldsDisplay($fields),
                "{}",
                $message
            ),
            None => tracing::event!($level, fields = %FieldsDisplay($fields), "{}", $message),
        }
    };
}

impl Logger for TracingLogger {
    fn log(&self, level: Level, meta: Option<&ContextMeta>, message: &str, fields: &[Field]) {
        // `event!` needs a constant level.
        match level {
            Level::ERROR => emit!(Level::ERROR, meta, message, fields),
            Level::WARN => emit!(Level::WARN, meta, message, fields),
            Level::INFO => emit!(Level::INFO, meta, message, fields),
            Level::DEBUG => emit!(Level::DEBUG, meta, message, fields),
            _ => emit!(Level::TRACE, meta, message, fields),
        }
    }
}

/// A captured log record.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: Level,
    pub meta: Option<ContextMeta>,
    pub message: String,
    pub fields: Vec<Field>,
}

impl LogRecord {
    /// Look up a field value by key.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|f| f.key == key).map(|f| &f.value)
    }

    /// Field value as a string slice, if it is a JSON string.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Value::as_str)
    }
}

/// Logger that keeps every record in memory.
///
/// Useful in tests and for diagnostics endpoints that need to inspect what was
/// logged.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records emitted at exactly `level`.
    pub fn at_level(&self, level: Level) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.level == level)
            .collect()
    }
}

impl Logger for MemoryLogger {
    fn log(&self, level: Level, meta: Option<&ContextMeta>, message: &str, fields: &[Field]) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LogRecord {
                level,
                meta: meta.cloned(),
                message: message.to_string(),
                fields: fields.to_vec(),
            });
    }
}
