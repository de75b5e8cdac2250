//! Access log stage.
//!
//! Emits exactly one info record per request after the rest of the chain has
//! produced its final response, and records request metrics.

use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;

use super::SharedPipeline;
use crate::http::context::RequestContext;
use crate::observability::{field, metrics};

pub async fn log_access(State(state): State<SharedPipeline>, req: Request, next: Next) -> Response {
    let start = Instant::now();
    let ctx = req.extensions().get::<RequestContext>().cloned();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let response = next.run(req).await;

    let cost = start.elapsed();
    let status = response.status().as_u16();
    let ip = ctx
        .as_ref()
        .and_then(RequestContext::client_ip)
        .map(|ip| ip.to_string())
        .unwrap_or_default();
    let errors = ctx
        .as_ref()
        .map(RequestContext::errors_summary)
        .unwrap_or_default();

    state.logger.info(
        ctx.as_ref().map(RequestContext::meta),
        &path,
        &[
            field("status", status),
            field("method", method.as_str()),
            field("path", path.as_str()),
            field("query", query),
            field("ip", ip),
            field("user-agent", user_agent),
            field("errors", errors),
            field("cost", format!("{cost:?}")),
        ],
    );
    metrics::record_request(method.as_str(), status, cost);

    response
}
