//! HTTP service scaffold.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ net::listener ──▶ http::server (accept loop, per-connection task)
//!                                            │
//!                                            ▼
//!                          http::middleware: context → access_log → recovery → body_limit
//!                                            │
//!                                            ▼
//!                                  route middleware → handler
//!
//!     SIGINT/SIGTERM ──▶ lifecycle::signals ──▶ root token ──▶ lifecycle::shutdown::run
//!                                                              (drain within grace period)
//! ```
//!
//! Exit code 0 on a clean shutdown, 1 on any startup, serve or shutdown failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use app_server::lifecycle::{self, startup};
use app_server::observability::{logging, metrics, SharedLogger, TracingLogger};

#[derive(Parser)]
#[command(name = "app-server")]
#[command(about = "HTTP service with graceful shutdown", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Override the listen address from the configuration.
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match startup::resolve_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("app-server: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }

    if let Err(err) = logging::init(&config.observability) {
        eprintln!("app-server: failed to initialize logging: {err}");
        return ExitCode::FAILURE;
    }

    tracing::info!(
        app = %config.app_name,
        run_mode = %config.run_mode,
        listen = %config.server.listen,
        "app-server v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(err) = metrics::init_metrics(addr) {
                    tracing::error!(error = %err, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let root = CancellationToken::new();
    if let Err(err) = lifecycle::signals::install(root.clone()) {
        tracing::error!(error = %err, "Failed to install signal handlers");
        return ExitCode::FAILURE;
    }

    let logger: SharedLogger = Arc::new(TracingLogger::new());
    let server = match startup::build_server(&config, logger.clone(), root.clone()) {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(error = %err, "Failed to build server");
            return ExitCode::FAILURE;
        }
    };

    let listener = match startup::bind(&config).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, "Failed to bind listener");
            return ExitCode::FAILURE;
        }
    };

    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    let code = match lifecycle::run(server, listener, root, grace).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "Server exited with error");
            ExitCode::FAILURE
        }
    };

    logger.flush();
    code
}
