//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (accept loop, hyper connection, lifecycle)
//!     → middleware/ (context → access log → recovery → body limit)
//!     → route.rs (per-route middleware, handler)
//!     → response (trace header echoed)
//! ```

pub mod context;
pub mod fault;
pub mod middleware;
pub mod options;
pub mod route;
pub mod server;

pub use context::{RequestContext, TraceId};
pub use fault::HandlerFault;
pub use options::{ByteLimit, ServerOptions, TraceOptions};
pub use route::{Route, RouteMiddleware};
pub use server::{Phase, ServeError, Server, ServerError, ShutdownError};
