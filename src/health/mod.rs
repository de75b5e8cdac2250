//! Built-in routes.
//!
//! `GET /health` answers `200 {"message":"success"}` as long as the process
//! is serving.

use axum::Json;
use serde::Serialize;

use crate::http::route::Route;

/// Body of the health response.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub message: &'static str,
}

pub async fn health() -> Json<HealthStatus> {
    Json(HealthStatus { message: "success" })
}

/// Every built-in route.
pub fn routes() -> Vec<Route> {
    vec![Route::get("/health", health)]
}
