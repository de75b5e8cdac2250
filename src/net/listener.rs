//! TCP listener helpers.
//!
//! # Responsibilities
//! - Resolve and bind the configured `host:port` address
//! - Classify accept errors as transient or fatal
//! - Back off between retries of transient accept errors

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{lookup_host, TcpListener};

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The address could not be parsed or resolved.
    #[error("Invalid listen address {address:?}: {source}")]
    Address {
        address: String,
        #[source]
        source: io::Error,
    },
    /// Failed to bind to address.
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Normalize a listen address to `host:port`.
///
/// Accepts socket addresses, `hostname:port` and `:port` (all IPv4
/// interfaces). Returns `None` when there is no numeric port.
pub fn normalize_address(address: &str) -> Option<String> {
    if address.parse::<SocketAddr>().is_ok() {
        return Some(address.to_string());
    }
    let (host, port) = address.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    match host {
        "" => Some(format!("0.0.0.0:{port}")),
        // Bare IPv6 literals must be bracketed.
        h if h.contains(':') => None,
        h => Some(format!("{h}:{port}")),
    }
}

/// Resolve `address` and bind a TCP listener to the first address that
/// accepts it.
pub async fn bind(address: &str) -> Result<TcpListener, ListenerError> {
    let invalid = |source: io::Error| ListenerError::Address {
        address: address.to_string(),
        source,
    };
    let target = normalize_address(address).ok_or_else(|| {
        invalid(io::Error::new(
            io::ErrorKind::InvalidInput,
            "expected host:port",
        ))
    })?;

    let mut last_err = None;
    for addr in lookup_host(target.as_str()).await.map_err(invalid)? {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                tracing::info!(
                    address = %listener.local_addr().unwrap_or(addr),
                    "Listener bound"
                );
                return Ok(listener);
            }
            Err(source) => last_err = Some(ListenerError::Bind { address: addr, source }),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        invalid(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "address resolved to nothing",
        ))
    }))
}

/// Whether an accept error only affects one pending connection (or is a
/// temporary resource shortage) rather than the listener itself.
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    // EMFILE / ENFILE / ENOBUFS / ENOMEM: out of descriptors or buffers.
    matches!(err.raw_os_error(), Some(12 | 23 | 24 | 105))
}

/// Exponential backoff between accept retries: 5ms doubling up to 1s.
#[derive(Debug, Default)]
pub struct AcceptBackoff {
    current: Option<Duration>,
}

impl AcceptBackoff {
    const INITIAL: Duration = Duration::from_millis(5);
    const MAX: Duration = Duration::from_secs(1);

    /// Next delay to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => Self::INITIAL,
            Some(d) => (d * 2).min(Self::MAX),
        };
        self.current = Some(next);
        next
    }

    /// Forget the delay after a successful accept.
    pub fn reset(&mut self) {
        self.current = None;
    }
}
