//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges and address formats
//! - Validate header names used for trace propagation
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AppConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use axum::http::HeaderName;

use crate::config::schema::AppConfig;
use crate::net::listener::normalize_address;

/// A single semantic problem found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

fn invalid(field: &'static str, message: impl Into<String>) -> ValidationError {
    ValidationError {
        field,
        message: message.into(),
    }
}

/// Check a loaded configuration for semantic errors.
pub fn validate_config(config: &AppConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if normalize_address(&config.server.listen).is_none() {
        errors.push(invalid(
            "server.listen",
            format!("expected host:port, got {:?}", config.server.listen),
        ));
    }

    if config.server.shutdown_grace_secs == 0 {
        errors.push(invalid("server.shutdown_grace_secs", "must be greater than 0"));
    }

    if config.trace.headers.is_empty() {
        errors.push(invalid("trace.headers", "at least one header is required"));
    }
    for name in &config.trace.headers {
        if HeaderName::try_from(name.as_str()).is_err() {
            errors.push(invalid("trace.headers", format!("invalid header name: {name:?}")));
        }
    }

    if !config.trace.response_header.is_empty()
        && HeaderName::try_from(config.trace.response_header.as_str()).is_err()
    {
        errors.push(invalid(
            "trace.response_header",
            format!("invalid header name: {:?}", config.trace.response_header),
        ));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(invalid(
            "observability.metrics_address",
            format!("not a socket address: {:?}", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
