//! HTTP service scaffold: server lifecycle manager and middleware pipeline.

pub mod config;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::AppConfig;
pub use http::{Server, ServerOptions};
pub use lifecycle::run;
