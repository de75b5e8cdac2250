//! Server options, resolved once before the server is built.
//!
//! # Design Decisions
//! - Options are plain values; `Server::new` validates and freezes them
//! - Size limits keep the "negative = default, zero = off" convention of the
//!   config file through [`ByteLimit`]
//! - Durations of zero mean "unbounded" except for keep-alive, where zero
//!   disables persistent connections

use std::fmt;
use std::time::Duration;

use axum::http::HeaderName;

use crate::config::AppConfig;
use crate::observability::SharedLogger;

/// Default maximum request body size: 32 MiB.
pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Default maximum request header size: 1 MiB.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 1024 * 1024;

/// Default keep-alive idle timeout.
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// A configurable size limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteLimit {
    /// Use the built-in default.
    Default,
    /// No limit enforced by the server.
    Unlimited,
    /// Limit to this many bytes.
    Bytes(usize),
}

impl ByteLimit {
    /// Interpret a raw config value: negative → default, zero → unlimited.
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            n if n < 0 => Self::Default,
            0 => Self::Unlimited,
            n => Self::Bytes(usize::try_from(n).unwrap_or(usize::MAX)),
        }
    }

    /// Effective limit, `None` meaning unlimited.
    pub fn resolve(self, default: usize) -> Option<usize> {
        match self {
            Self::Default => Some(default),
            Self::Unlimited => None,
            Self::Bytes(n) => Some(n),
        }
    }
}

/// Trace ID propagation settings.
#[derive(Debug, Clone)]
pub struct TraceOptions {
    /// Inbound headers checked for a trace ID, highest priority first.
    pub headers: Vec<HeaderName>,
    /// Response header the trace ID is echoed on.
    pub response_header: Option<HeaderName>,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            headers: vec![
                HeaderName::from_static("x-trace-id"),
                HeaderName::from_static("x-request-id"),
                HeaderName::from_static("traceparent"),
            ],
            response_header: Some(HeaderName::from_static("x-trace-id")),
        }
    }
}

/// Everything the server needs to know before it starts.
#[derive(Clone)]
pub struct ServerOptions {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub keep_alive_timeout: Duration,
    pub max_body_bytes: ByteLimit,
    pub max_header_bytes: ByteLimit,
    pub logger: Option<SharedLogger>,
    pub allow_sensitive_dump: bool,
    pub error_log_stack: bool,
    pub recovery_stack: bool,
    pub trace: TraceOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            max_body_bytes: ByteLimit::Default,
            max_header_bytes: ByteLimit::Default,
            logger: None,
            allow_sensitive_dump: false,
            error_log_stack: false,
            recovery_stack: true,
            trace: TraceOptions::default(),
        }
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("keep_alive_timeout", &self.keep_alive_timeout)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("max_header_bytes", &self.max_header_bytes)
            .field("logger", &self.logger.as_ref().map(|_| "<logger>"))
            .field("allow_sensitive_dump", &self.allow_sensitive_dump)
            .field("error_log_stack", &self.error_log_stack)
            .field("recovery_stack", &self.recovery_stack)
            .field("trace", &self.trace)
            .finish()
    }
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve options from a validated config file.
    ///
    /// Header names were checked by validation; any that still fail to parse
    /// are skipped.
    pub fn from_config(config: &AppConfig, logger: SharedLogger) -> Self {
        let server = &config.server;
        let headers = config
            .trace
            .headers
            .iter()
            .filter_map(|h| HeaderName::try_from(h.as_str()).ok())
            .collect();
        let response_header = if config.trace.response_header.is_empty() {
            None
        } else {
            HeaderName::try_from(config.trace.response_header.as_str()).ok()
        };

        Self {
            read_timeout: Duration::from_secs(server.read_timeout_secs),
            write_timeout: Duration::from_secs(server.write_timeout_secs),
            keep_alive_timeout: Duration::from_secs(server.idle_timeout_secs),
            max_body_bytes: ByteLimit::from_raw(server.max_body_bytes),
            max_header_bytes: ByteLimit::from_raw(server.max_header_bytes),
            logger: Some(logger),
            allow_sensitive_dump: config.recovery.allow_sensitive_dump,
            error_log_stack: config.recovery.error_log_stack,
            recovery_stack: config.recovery.recovery_stack,
            trace: TraceOptions {
                headers,
                response_header,
            },
        }
    }

    pub fn with_logger(mut self, logger: SharedLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Idle timeout for kept-alive connections. Zero disables keep-alive.
    pub fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    pub fn with_max_body_bytes(mut self, limit: ByteLimit) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn with_max_header_bytes(mut self, limit: ByteLimit) -> Self {
        self.max_header_bytes = limit;
        self
    }

    /// Let the recovery dump include sensitive headers verbatim.
    pub fn with_sensitive_dump(mut self, allow: bool) -> Self {
        self.allow_sensitive_dump = allow;
        self
    }

    pub fn with_error_log_stack(mut self, enable: bool) -> Self {
        self.error_log_stack = enable;
        self
    }

    pub fn with_recovery_stack(mut self, enable: bool) -> Self {
        self.recovery_stack = enable;
        self
    }

    pub fn with_trace(mut self, trace: TraceOptions) -> Self {
        self.trace = trace;
        self
    }

    /// Effective body limit; `None` disables the guard.
    pub fn body_limit(&self) -> Option<usize> {
        self.max_body_bytes.resolve(DEFAULT_MAX_BODY_BYTES)
    }

    /// Effective header limit; `None` leaves the engine default in place.
    pub fn header_limit(&self) -> Option<usize> {
        self.max_header_bytes.resolve(DEFAULT_MAX_HEADER_BYTES)
    }
}
