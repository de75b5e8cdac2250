//! Shutdown orchestration.
//!
//! # Responsibilities
//! - Run the server on a background task
//! - Wait for either an OS signal or the server stopping on its own
//! - On signal, drain with a bounded grace period and wait for the serve
//!   task to actually return
//!
//! # Design Decisions
//! - The serve task reports through a single-slot `oneshot` channel
//! - A shutdown deadline is reported as an error; the caller decides the
//!   exit code

use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::http::server::{ServeError, Server, ShutdownError};
use crate::observability::field;

/// Errors that end [`run`].
#[derive(Debug, Error)]
pub enum RunError {
    #[error("server failed: {0}")]
    Serve(#[source] ServeError),

    #[error("shutdown failed: {0}")]
    Shutdown(#[source] ShutdownError),

    #[error("serve task ended without reporting a result")]
    ServeTaskLost,
}

type ServeResult = Result<(), ServeError>;

fn completion(result: Result<ServeResult, oneshot::error::RecvError>) -> Result<(), RunError> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(RunError::Serve(err)),
        Err(_) => Err(RunError::ServeTaskLost),
    }
}

/// Serve `listener` until `signal` is cancelled, then shut down within `grace`.
pub async fn run(
    server: Server,
    listener: TcpListener,
    signal: CancellationToken,
    grace: Duration,
) -> Result<(), RunError> {
    let (done_tx, mut done_rx) = oneshot::channel::<ServeResult>();
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = done_tx.send(serving.serve(listener).await);
    });

    tokio::select! {
        result = &mut done_rx => return completion(result),
        _ = signal.cancelled() => {}
    }

    server.logger().info(
        None,
        "Shutdown signal received",
        &[field("grace", format!("{grace:?}"))],
    );
    server.shutdown(grace).await.map_err(RunError::Shutdown)?;

    let result = completion(done_rx.await);
    if result.is_ok() {
        server.logger().info(None, "Shutdown complete", &[]);
    }
    result
}
