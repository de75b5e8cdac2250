//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the service.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the service.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application name, used in startup logs.
    pub app_name: String,

    /// Run mode (debug, test, release).
    pub run_mode: String,

    /// HTTP server settings.
    pub server: ServerConfig,

    /// Panic recovery settings.
    pub recovery: RecoveryConfig,

    /// Trace ID propagation settings.
    pub trace: TraceConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: "app-server".to_string(),
            run_mode: "release".to_string(),
            server: ServerConfig::default(),
            recovery: RecoveryConfig::default(),
            trace: TraceConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:8080").
    pub listen: String,

    /// Time allowed to receive request headers, in seconds (0 = unbounded).
    pub read_timeout_secs: u64,

    /// Time allowed for a handler to produce its response, in seconds (0 = unbounded).
    pub write_timeout_secs: u64,

    /// Keep-alive idle timeout in seconds (0 = keep-alive disabled).
    pub idle_timeout_secs: u64,

    /// Maximum request body size in bytes (-1 = default 32 MiB, 0 = unlimited).
    pub max_body_bytes: i64,

    /// Maximum request header size in bytes (-1 = default 1 MiB, 0 = engine default).
    pub max_header_bytes: i64,

    /// Grace period for in-flight requests on shutdown, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            read_timeout_secs: 0,
            write_timeout_secs: 0,
            idle_timeout_secs: 60,
            max_body_bytes: -1,
            max_header_bytes: -1,
            shutdown_grace_secs: 10,
        }
    }
}

/// Panic recovery configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Dump sensitive headers (Authorization, Cookie, ...) verbatim.
    pub allow_sensitive_dump: bool,

    /// Attach a stack trace to server error log records.
    pub error_log_stack: bool,

    /// Attach the panic backtrace to recovery records.
    pub recovery_stack: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            allow_sensitive_dump: false,
            error_log_stack: false,
            recovery_stack: true,
        }
    }
}

/// Trace ID propagation configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Headers to read the trace ID from, in priority order.
    pub headers: Vec<String>,

    /// Response header to echo the trace ID on (empty = disabled).
    pub response_header: String,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            headers: vec![
                "x-trace-id".to_string(),
                "x-request-id".to_string(),
                "traceparent".to_string(),
            ],
            response_header: "x-trace-id".to_string(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
