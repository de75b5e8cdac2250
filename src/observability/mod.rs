//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Server, middleware and handlers produce:
//!     → logger.rs (Logger port, request-scoped records)
//!     → metrics.rs (counters, histograms)
//!
//! Sinks:
//!     → logging.rs (tracing subscriber: stdout, pretty or JSON)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Trace ID flows through every record of a request
//! - The logger is an injected dependency, not a global

pub mod logger;
pub mod logging;
pub mod metrics;

pub use logger::{field, ContextMeta, Field, LogRecord, Logger, MemoryLogger, SharedLogger, TracingLogger};
