//! Recovery stage.
//!
//! # Responsibilities
//! - Run the inner chain inside a fault boundary
//! - Turn panics into a logged `500`
//! - Drop the connection without a response when the peer is already gone
//! - Redact credentials from the request dump unless explicitly allowed
//!
//! # Design Decisions
//! - The request line and headers are snapshotted up front; the dump is only
//!   rendered when a fault actually happens
//! - Exactly one error record per fault

use std::borrow::Cow;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri, Version};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::SharedPipeline;
use crate::http::context::RequestContext;
use crate::http::fault::{catch_fault, HandlerFault};
use crate::observability::{field, metrics};

/// Headers replaced by [`REDACTED`] in the safe dump.
pub const SENSITIVE_HEADERS: [&str; 6] = [
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
    "proxy-authorization",
];

pub const REDACTED: &str = "[REDACTED]";

/// Response marker: the connection must be closed without writing this
/// response.
#[derive(Debug, Clone, Copy)]
pub struct AbortConnection;

/// Request line and headers captured before the handler runs.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
}

impl RequestSnapshot {
    pub fn capture(req: &Request) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
        }
    }

    /// Render as `METHOD uri VERSION` followed by one `name: value` line per
    /// header. Sensitive values are redacted unless `allow_sensitive`.
    pub fn dump(&self, allow_sensitive: bool) -> String {
        let mut out = format!("{} {} {:?}\n", self.method, self.uri, self.version);
        for (name, value) in &self.headers {
            let value = if !allow_sensitive && is_sensitive(name.as_str()) {
                Cow::Borrowed(REDACTED)
            } else {
                String::from_utf8_lossy(value.as_bytes())
            };
            out.push_str(name.as_str());
            out.push_str(": ");
            out.push_str(&value);
            out.push('\n');
        }
        out
    }
}

fn is_sensitive(name: &str) -> bool {
    SENSITIVE_HEADERS
        .iter()
        .any(|s| s.eq_ignore_ascii_case(name))
}

pub async fn recover(State(state): State<SharedPipeline>, req: Request, next: Next) -> Response {
    let snapshot = RequestSnapshot::capture(&req);
    let ctx = req.extensions().get::<RequestContext>().cloned();

    let guarded = catch_fault(next.run(req)).with_backtrace(state.options.recovery_stack);
    match guarded.await {
        Ok(response) => response,
        Err(fault) => handle_fault(&state, ctx.as_ref(), &snapshot, fault),
    }
}

fn handle_fault(
    state: &SharedPipeline,
    ctx: Option<&RequestContext>,
    snapshot: &RequestSnapshot,
    fault: HandlerFault,
) -> Response {
    metrics::record_panic(fault.kind());
    let meta = ctx.map(RequestContext::meta);
    let dump = snapshot.dump(state.options.allow_sensitive_dump);

    match fault {
        HandlerFault::BrokenPipe { message } => {
            state.logger.error(
                meta,
                snapshot.uri.path(),
                &[field("error", message.as_str()), field("request", dump)],
            );
            if let Some(ctx) = ctx {
                ctx.record_error(&message);
            }
            let mut response = StatusCode::INTERNAL_SERVER_ERROR.into_response();
            response.extensions_mut().insert(AbortConnection);
            response
        }
        HandlerFault::Panic { message, site } => {
            let mut fields = vec![field("error", message), field("request", dump)];
            if state.options.recovery_stack {
                if let Some(site) = site {
                    let stack = match site.backtrace {
                        Some(backtrace) => format!("panicked at {}\n{backtrace}", site.location),
                        None => format!("panicked at {}", site.location),
                    };
                    fields.push(field("stack", stack));
                }
            }
            state.logger.error(meta, "[Recovery from panic]", &fields);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
