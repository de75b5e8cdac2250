//! OS signal handling.
//!
//! # Responsibilities
//! - Register SIGINT and SIGTERM handlers (Ctrl-C elsewhere)
//! - Translate the first signal into cancellation of the root token
//!
//! # Design Decisions
//! - Handlers are registered synchronously so registration failures surface
//!   at startup, before serving begins
//! - The root token doubles as the base context of every connection, so
//!   cooperative handlers see the signal too

use std::io;

use tokio_util::sync::CancellationToken;

/// Install signal handlers that cancel `token` on the first SIGINT/SIGTERM.
#[cfg(unix)]
pub fn install(token: CancellationToken) -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
            _ = sigint.recv() => tracing::info!("SIGINT received, shutting down"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    });
    Ok(())
}

/// Install a Ctrl-C handler that cancels `token`.
#[cfg(not(unix))]
pub fn install(token: CancellationToken) -> io::Result<()> {
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    tracing::error!(error = %err, "Failed to listen for Ctrl-C");
                    return;
                }
                tracing::info!("Ctrl-C received, shutting down");
            }
            _ = token.cancelled() => return,
        }
        token.cancel();
    });
    Ok(())
}
