//! Per-request context and trace identifiers.
//!
//! # Responsibilities
//! - Resolve the trace ID from inbound headers or generate a fresh one
//! - Carry request metadata, cancellation and the logger to handlers
//! - Accumulate request-local errors for the access log
//!
//! # Design Decisions
//! - The context is created once per request by the context middleware and
//!   handed to handlers through request extensions
//! - Cloning is cheap; all clones observe the same error list
//! - Generated trace IDs are 16 CSPRNG bytes rendered as lowercase hex

use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, StatusCode};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::observability::{ContextMeta, Field, SharedLogger};

/// Longest inbound trace ID accepted verbatim.
pub const MAX_TRACE_ID_LEN: usize = 128;

const TRACEPARENT: &str = "traceparent";

/// Identifier that ties every log record of a request together.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceId(String);

impl TraceId {
    /// Fresh random trace ID: 32 lowercase hex characters.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode(bytes))
    }

    /// Accept a directly supplied ID: trimmed, non-empty, printable ASCII,
    /// at most [`MAX_TRACE_ID_LEN`] bytes.
    pub fn parse_direct(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() || value.len() > MAX_TRACE_ID_LEN {
            return None;
        }
        if !value.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
            return None;
        }
        Some(Self(value.to_string()))
    }

    /// Extract the trace segment of a W3C `traceparent` value.
    ///
    /// Requires at least four dash-separated parts with a 32-hex second part.
    pub fn parse_traceparent(value: &str) -> Option<Self> {
        let parts: Vec<&str> = value.trim().split('-').collect();
        if parts.len() < 4 {
            return None;
        }
        let trace = parts[1];
        if trace.len() != 32 || !trace.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(trace.to_ascii_lowercase()))
    }

    /// First valid ID among `headers`, checked in order.
    pub fn from_headers(map: &HeaderMap, headers: &[HeaderName]) -> Option<Self> {
        headers.iter().find_map(|name| {
            let value = map.get(name)?.to_str().ok()?;
            if name.as_str() == TRACEPARENT {
                Self::parse_traceparent(value)
            } else {
                Self::parse_direct(value)
            }
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cancellation token of the connection a request arrived on.
#[derive(Debug, Clone)]
pub struct ConnectionToken(pub CancellationToken);

struct Inner {
    meta: ContextMeta,
    token: CancellationToken,
    logger: SharedLogger,
    errors: Mutex<Vec<String>>,
}

/// Request-scoped context available to middleware and handlers.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<Inner>,
}

impl RequestContext {
    pub fn new(meta: ContextMeta, token: CancellationToken, logger: SharedLogger) -> Self {
        Self {
            inner: Arc::new(Inner {
                meta,
                token,
                logger,
                errors: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn meta(&self) -> &ContextMeta {
        &self.inner.meta
    }

    pub fn trace_id(&self) -> &str {
        &self.inner.meta.trace_id
    }

    pub fn client_ip(&self) -> Option<IpAddr> {
        self.inner.meta.user_ip
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Resolves when the request, its connection, or the server is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn info(&self, message: &str, fields: &[Field]) {
        self.inner.logger.info(Some(&self.inner.meta), message, fields);
    }

    pub fn warn(&self, message: &str, fields: &[Field]) {
        self.inner.logger.warn(Some(&self.inner.meta), message, fields);
    }

    pub fn error(&self, message: &str, fields: &[Field]) {
        self.inner.logger.error(Some(&self.inner.meta), message, fields);
    }

    /// Attach an error to this request; it shows up in the access log.
    pub fn record_error(&self, error: impl fmt::Display) {
        self.lock_errors().push(error.to_string());
    }

    pub fn errors(&self) -> Vec<String> {
        self.lock_errors().clone()
    }

    /// Errors rendered one per line as `Error #NN: message`.
    pub fn errors_summary(&self) -> String {
        self.lock_errors()
            .iter()
            .enumerate()
            .map(|(i, e)| format!("Error #{:02}: {e}\n", i + 1))
            .collect()
    }

    fn lock_errors(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.inner
            .errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("meta", &self.inner.meta)
            .field("cancelled", &self.inner.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .ok_or((StatusCode::INTERNAL_SERVER_ERROR, "request context missing"))
    }
}
