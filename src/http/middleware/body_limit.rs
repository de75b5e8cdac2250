//! Request body size guard.
//!
//! Bodies of `POST`, `PUT` and `PATCH` requests are wrapped in a length-limited
//! body. Reading past the limit fails, and axum's buffering extractors turn
//! that failure into `413 Payload Too Large`.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::Response;
use http_body_util::Limited;

use super::SharedPipeline;

fn carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

pub async fn limit_body(State(state): State<SharedPipeline>, req: Request, next: Next) -> Response {
    match state.options.body_limit() {
        Some(limit) if carries_body(req.method()) => {
            next.run(req.map(|body| Body::new(Limited::new(body, limit))))
                .await
        }
        _ => next.run(req).await,
    }
}
