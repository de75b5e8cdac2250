//! Request context stage.
//!
//! Runs first. Resolves the trace ID and client IP, derives the request's
//! cancellation token, wraps the rest of the chain in a `tracing` span and
//! echoes the trace ID on the response. Never fails a request.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument;

use super::SharedPipeline;
use crate::http::context::{ConnectionToken, RequestContext, TraceId};
use crate::observability::ContextMeta;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Client address: first `X-Forwarded-For` entry, then `X-Real-IP`, then the
/// socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> Option<IpAddr> {
    let forwarded = headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok());
    forwarded
        .or_else(|| {
            headers
                .get(X_REAL_IP)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
        })
        .or(peer)
}

pub async fn inject_context(
    State(state): State<SharedPipeline>,
    mut req: Request,
    next: Next,
) -> Response {
    let parent = req
        .extensions()
        .get::<ConnectionToken>()
        .map(|t| t.0.clone())
        .unwrap_or_else(|| state.base.clone());
    let token = parent.child_token();
    // Cancel the request token however the request ends.
    let _cancel_on_exit = token.clone().drop_guard();

    let trace_id = TraceId::from_headers(req.headers(), &state.options.trace.headers)
        .unwrap_or_else(TraceId::generate);
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let meta = ContextMeta {
        trace_id: trace_id.to_string(),
        user_ip: client_ip(req.headers(), peer),
        path: req.uri().path().to_string(),
        user_agent: req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        method: req.method().to_string(),
    };

    let span = tracing::info_span!(
        "request",
        trace_id = %meta.trace_id,
        method = %meta.method,
        path = %meta.path,
    );

    req.extensions_mut()
        .insert(RequestContext::new(meta, token, state.logger.clone()));

    let mut response = next.run(req).instrument(span).await;

    if let Some(name) = &state.options.trace.response_header {
        if let Ok(value) = HeaderValue::from_str(trace_id.as_str()) {
            response.headers_mut().insert(name.clone(), value);
        }
    }
    response
}
