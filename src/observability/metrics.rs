//! Metrics collection and exposition.
//!
//! # Metrics
//! - `http_requests_total` (counter): completed requests by method, status
//! - `http_request_duration_seconds` (histogram): latency distribution
//! - `http_handler_panics_total` (counter): recovered panics by kind
//!
//! # Design Decisions
//! - Recording is a no-op until an exporter is installed
//! - Labels stay low-cardinality (no raw paths)

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter with an HTTP scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

/// Record one completed request.
pub fn record_request(method: &str, status: u16, elapsed: Duration) {
    let method = method.to_string();
    let status = status.to_string();
    metrics::counter!("http_requests_total", "method" => method.clone(), "status" => status.clone())
        .increment(1);
    metrics::histogram!("http_request_duration_seconds", "method" => method, "status" => status)
        .record(elapsed.as_secs_f64());
}

/// Record one recovered handler fault.
pub fn record_panic(kind: &'static str) {
    metrics::counter!("http_handler_panics_total", "kind" => kind).increment(1);
}
