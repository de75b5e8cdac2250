//! Startup orchestration.
//!
//! # Responsibilities
//! - Resolve configuration (explicit path, else built-in defaults)
//! - Build the server from configuration and register built-in routes
//! - Bind the listener before serving starts
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - The listener is bound last so traffic only arrives once everything is
//!   ready

use std::path::Path;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::{load_config, AppConfig, ConfigError};
use crate::health;
use crate::http::options::ServerOptions;
use crate::http::server::{Server, ServerError};
use crate::net::listener::{self, ListenerError};
use crate::observability::SharedLogger;

/// Load the config file at `path`, or fall back to defaults when none is given.
pub fn resolve_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match path {
        Some(path) => load_config(path),
        None => Ok(AppConfig::default()),
    }
}

/// Build a server from `config` with the built-in routes registered.
pub fn build_server(
    config: &AppConfig,
    logger: SharedLogger,
    base: CancellationToken,
) -> Result<Server, ServerError> {
    let options = ServerOptions::from_config(config, logger);
    let server = Server::new(base, config.server.listen.clone(), options)?;
    server.register_all(health::routes())?;
    Ok(server)
}

/// Bind the configured listen address.
pub async fn bind(config: &AppConfig) -> Result<TcpListener, ListenerError> {
    listener::bind(&config.server.listen).await
}
