//! Global request middleware.
//!
//! # Data Flow
//! ```text
//! Request
//!     → context.rs     (trace ID, client IP, cancellation, span)
//!     → access_log.rs  (one record per request, metrics)
//!     → recovery.rs    (fault boundary, panic → 500)
//!     → write timeout  (optional, 408)
//!     → body_limit.rs  (POST/PUT/PATCH length guard)
//!     → per-route middleware
//!     → handler
//! ```
//!
//! # Design Decisions
//! - The order is fixed; routes cannot opt out
//! - Access log sits outside recovery so it sees the final status
//! - axum's own body limit is disabled so the configured one is authoritative

pub mod access_log;
pub mod body_limit;
pub mod context;
pub mod recovery;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;

use crate::http::options::ServerOptions;
use crate::observability::SharedLogger;

pub use recovery::AbortConnection;

/// State shared by every global middleware stage.
pub struct PipelineState {
    pub logger: SharedLogger,
    pub options: ServerOptions,
    /// Fallback parent for request tokens when no connection token is present.
    pub base: CancellationToken,
}

pub type SharedPipeline = Arc<PipelineState>;

/// Wrap `router` in the global middleware stack.
pub fn build(router: Router, state: SharedPipeline) -> Router {
    let mut router = router.layer(from_fn_with_state(state.clone(), body_limit::limit_body));

    let write_timeout = state.options.write_timeout;
    if !write_timeout.is_zero() {
        router = router.layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            write_timeout,
        ));
    }

    router
        .layer(from_fn_with_state(state.clone(), recovery::recover))
        .layer(from_fn_with_state(state.clone(), access_log::log_access))
        .layer(from_fn_with_state(state, context::inject_context))
        .layer(DefaultBodyLimit::disable())
}
