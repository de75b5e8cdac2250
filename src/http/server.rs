//! HTTP server lifecycle.
//!
//! # Responsibilities
//! - Own the route table until serving starts, then freeze it
//! - Run the accept loop and one task per connection
//! - Apply connection-level limits (header size, header read timeout,
//!   keep-alive)
//! - Coordinate a bounded graceful shutdown and run caller shutdown hooks
//!
//! # Design Decisions
//! - The lifecycle is an owned enum behind a mutex; the router lives inside
//!   the `Idle` variant so it cannot be touched once serving begins
//! - Phase changes are mirrored into a `watch` channel for observers
//! - Only the serve loop drops the listener; `shutdown` signals and waits
//! - Connections are served through hyper-util's auto builder so HTTP/1.1 and
//!   HTTP/2 share one path

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::handler::Handler;
use axum::http::Method;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::http::context::ConnectionToken;
use crate::http::fault::install_panic_hook;
use crate::http::middleware::{self, AbortConnection, PipelineState};
use crate::http::options::ServerOptions;
use crate::http::route::Route;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{self, is_transient_accept_error, AcceptBackoff, ListenerError};
use crate::observability::{field, SharedLogger};

/// Smallest read buffer hyper accepts.
const MIN_HEADER_BUF: usize = 8192;

/// Errors raised while building the server or registering routes.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server options must include a logger")]
    MissingLogger,

    #[error("cannot register {method} {path}: server already started")]
    RoutesFrozen { method: Method, path: String },

    #[error("unsupported route method: {method}")]
    UnsupportedMethod { method: Method },

    #[error("invalid route path {path:?}: must start with '/'")]
    InvalidPath { path: String },

    #[error("route {method} {path} is already registered")]
    DuplicateRoute { method: Method, path: String },

    #[error("cannot register shutdown hook: server is shutting down or closed")]
    ShutdownStarted,
}

/// Errors that end serving.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("no listen address configured")]
    NoAddress,

    #[error(transparent)]
    Bind(#[from] ListenerError),

    #[error("server already started")]
    AlreadyStarted,

    #[error("server is closed")]
    Closed,

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

/// Errors returned by [`Server::shutdown`].
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("shutdown did not finish within {grace:?} ({active_connections} connections still open)")]
    DeadlineExceeded {
        grace: Duration,
        active_connections: u64,
    },

    #[error("server already closed")]
    AlreadyClosed,
}

/// Observable lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Serving,
    ShuttingDown,
    Closed,
}

/// Routes collected while idle.
#[derive(Default)]
struct RouteTable {
    router: Router,
    registered: HashSet<(Method, String)>,
}

impl RouteTable {
    fn insert(&mut self, route: Route) -> Result<(), ServerError> {
        let method = route.method().clone();
        let path = route.path().to_string();
        if !path.starts_with('/') {
            return Err(ServerError::InvalidPath { path });
        }
        if self.registered.contains(&(method.clone(), path.clone())) {
            return Err(ServerError::DuplicateRoute { method, path });
        }
        let endpoint = route
            .into_endpoint()
            .ok_or_else(|| ServerError::UnsupportedMethod {
                method: method.clone(),
            })?;

        let router = std::mem::take(&mut self.router);
        self.router = router.route(&path, endpoint);
        self.registered.insert((method, path));
        Ok(())
    }
}

enum Lifecycle {
    Idle(RouteTable),
    Serving,
    ShuttingDown,
    Closed,
}

impl Lifecycle {
    fn phase(&self) -> Phase {
        match self {
            Self::Idle(_) => Phase::Idle,
            Self::Serving => Phase::Serving,
            Self::ShuttingDown => Phase::ShuttingDown,
            Self::Closed => Phase::Closed,
        }
    }
}

/// Callback run once when shutdown begins.
type ShutdownHook = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    state: Mutex<Lifecycle>,
    hooks: Mutex<Vec<ShutdownHook>>,
    phase: watch::Sender<Phase>,
    options: ServerOptions,
    logger: SharedLogger,
    base: CancellationToken,
    stop: CancellationToken,
    tracker: ConnectionTracker,
    address: String,
}

/// Connection-level failure that closes the connection without a response.
#[derive(Debug, Error)]
#[error("connection aborted after the peer went away")]
struct ConnectionAborted;

/// HTTP server handle. Cheap to clone; all clones drive the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Shared>,
}

impl Server {
    /// Build a server.
    ///
    /// `base` is the parent of every connection and request token.
    /// `address` is used by [`Server::listen_and_serve`] and may be empty when
    /// the caller binds its own listener.
    pub fn new(
        base: CancellationToken,
        address: impl Into<String>,
        options: ServerOptions,
    ) -> Result<Self, ServerError> {
        let logger = options.logger.clone().ok_or(ServerError::MissingLogger)?;
        install_panic_hook();

        let (phase, _) = watch::channel(Phase::Idle);
        Ok(Self {
            inner: Arc::new(Shared {
                state: Mutex::new(Lifecycle::Idle(RouteTable::default())),
                hooks: Mutex::new(Vec::new()),
                phase,
                options,
                logger,
                base,
                stop: CancellationToken::new(),
                tracker: ConnectionTracker::new(),
                address: address.into(),
            }),
        })
    }

    pub fn options(&self) -> &ServerOptions {
        &self.inner.options
    }

    pub fn logger(&self) -> &SharedLogger {
        &self.inner.logger
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.borrow()
    }

    /// Subscribe to phase changes.
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.inner.phase.subscribe()
    }

    pub fn active_connections(&self) -> u64 {
        self.inner.tracker.active_count()
    }

    /// Register a handler for `method` and `path`.
    pub fn add_route<H, T>(&self, method: Method, path: &str, handler: H) -> Result<(), ServerError>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.register(Route::new(method, path, handler))
    }

    /// Register a route. Only allowed before serving starts.
    pub fn register(&self, route: Route) -> Result<(), ServerError> {
        let method = route.method().clone();
        let path = route.path().to_string();

        let result = {
            let mut state = self.lock();
            match &mut *state {
                Lifecycle::Idle(table) => table.insert(route),
                _ => Err(ServerError::RoutesFrozen {
                    method: method.clone(),
                    path: path.clone(),
                }),
            }
        };

        if let Err(err) = &result {
            self.inner.logger.error(
                None,
                "Route registration rejected",
                &[
                    field("method", method.as_str()),
                    field("path", path),
                    field("error", err.to_string()),
                ],
            );
        }
        result
    }

    pub fn register_all(&self, routes: impl IntoIterator<Item = Route>) -> Result<(), ServerError> {
        routes.into_iter().try_for_each(|route| self.register(route))
    }

    /// Register `hook` to run when shutdown begins.
    ///
    /// Hooks run once, in registration order, on the first transition out of
    /// `Idle` or `Serving` triggered by [`Server::shutdown`]. They are a
    /// signal to release long-lived work (streams, background tasks) and
    /// should return quickly.
    pub fn on_shutdown(&self, hook: impl FnOnce() + Send + 'static) -> Result<(), ServerError> {
        let state = self.lock();
        match &*state {
            Lifecycle::Idle(_) | Lifecycle::Serving => {
                self.lock_hooks().push(Box::new(hook));
                Ok(())
            }
            Lifecycle::ShuttingDown | Lifecycle::Closed => Err(ServerError::ShutdownStarted),
        }
    }

    /// Bind the configured address and serve on it.
    pub async fn listen_and_serve(&self) -> Result<(), ServeError> {
        if self.inner.address.is_empty() {
            return Err(ServeError::NoAddress);
        }
        let listener = listener::bind(&self.inner.address).await?;
        self.serve(listener).await
    }

    /// Serve on `listener` until shutdown.
    ///
    /// Returns once the listener is closed and every connection has finished.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServeError> {
        let table = {
            let mut state = self.lock();
            match std::mem::replace(&mut *state, Lifecycle::Serving) {
                Lifecycle::Idle(table) => {
                    self.inner.phase.send_replace(Phase::Serving);
                    table
                }
                other => {
                    let err = match other {
                        Lifecycle::Closed => ServeError::Closed,
                        _ => ServeError::AlreadyStarted,
                    };
                    *state = other;
                    return Err(err);
                }
            }
        };

        let app = middleware::build(
            table.router,
            Arc::new(PipelineState {
                logger: self.inner.logger.clone(),
                options: self.inner.options.clone(),
                base: self.inner.base.clone(),
            }),
        );
        let builder = self.connection_builder();

        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        self.inner
            .logger
            .info(None, "Server listening", &[field("address", local)]);

        let result = self.accept_loop(&listener, app, builder).await;

        drop(listener);
        self.inner.stop.cancel();
        self.inner.tracker.wait_idle().await;
        self.set_state(Lifecycle::Closed);
        self.inner.logger.info(None, "Server stopped", &[]);
        result
    }

    async fn accept_loop(
        &self,
        listener: &TcpListener,
        app: Router,
        builder: auto::Builder<TokioExecutor>,
    ) -> Result<(), ServeError> {
        let stop = &self.inner.stop;
        let mut backoff = AcceptBackoff::default();

        loop {
            let accepted = tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote)) => {
                    backoff.reset();
                    self.spawn_connection(stream, remote, app.clone(), builder.clone());
                }
                Err(err) if is_transient_accept_error(&err) => {
                    let delay = backoff.next_delay();
                    self.inner.logger.warn(
                        None,
                        "Accept failed, retrying",
                        &[
                            field("error", err.to_string()),
                            field("retry_in", format!("{delay:?}")),
                        ],
                    );
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    self.inner
                        .logger
                        .error(None, "Accept failed", &[field("error", err.to_string())]);
                    return Err(ServeError::Accept(err));
                }
            }
        }
    }

    fn connection_builder(&self) -> auto::Builder<TokioExecutor> {
        let options = &self.inner.options;
        let mut builder = auto::Builder::new(TokioExecutor::new());

        // Read timeout wins; otherwise the idle timeout bounds the wait for
        // the next request head.
        let header_timeout = [options.read_timeout, options.keep_alive_timeout]
            .into_iter()
            .find(|d| !d.is_zero());

        {
            let mut http1 = builder.http1();
            http1.timer(TokioTimer::new());
            http1.keep_alive(!options.keep_alive_timeout.is_zero());
            if let Some(timeout) = header_timeout {
                http1.header_read_timeout(timeout);
            }
            if let Some(limit) = options.header_limit() {
                http1.max_buf_size(limit.max(MIN_HEADER_BUF));
            }
        }
        builder.http2().timer(TokioTimer::new());
        builder
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        app: Router,
        builder: auto::Builder<TokioExecutor>,
    ) {
        let guard = self.inner.tracker.track();
        let token = self.inner.base.child_token();
        let stop = self.inner.stop.clone();
        let logger = self.inner.logger.clone();
        let error_log_stack = self.inner.options.error_log_stack;

        tokio::spawn(async move {
            let connection_id = guard.id();
            let request_token = token.clone();
            let service = hyper::service::service_fn(move |mut req: hyper::Request<Incoming>| {
                req.extensions_mut().insert(ConnectInfo(remote));
                req.extensions_mut()
                    .insert(ConnectionToken(request_token.clone()));
                let app = app.clone();
                async move {
                    let response = match app.oneshot(req).await {
                        Ok(response) => response,
                        Err(never) => match never {},
                    };
                    if response.extensions().get::<AbortConnection>().is_some() {
                        return Err(ConnectionAborted);
                    }
                    Ok(response)
                }
            });

            let conn = builder.serve_connection(TokioIo::new(stream), service);
            tokio::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = stop.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    conn.as_mut().await
                }
            };

            if let Err(err) = result {
                if !is_aborted(err.as_ref()) {
                    let mut fields = vec![
                        field("error", err.to_string()),
                        field("remote", remote.to_string()),
                        field("connection", connection_id.to_string()),
                    ];
                    if error_log_stack {
                        fields.push(field(
                            "stack",
                            std::backtrace::Backtrace::force_capture().to_string(),
                        ));
                    }
                    logger.warn(None, "http: connection error", &fields);
                }
            }
            token.cancel();
            drop(guard);
        });
    }

    /// Stop accepting, drain in-flight requests and wait up to `grace` for the
    /// server to close.
    ///
    /// Calling it on an idle server closes it immediately. Concurrent callers
    /// all wait on the same drain.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), ShutdownError> {
        let (hooks, closed) = {
            let mut state = self.lock();
            match &*state {
                Lifecycle::Idle(_) => {
                    *state = Lifecycle::Closed;
                    self.inner.phase.send_replace(Phase::Closed);
                    (self.take_hooks(), true)
                }
                Lifecycle::Serving => {
                    *state = Lifecycle::ShuttingDown;
                    self.inner.phase.send_replace(Phase::ShuttingDown);
                    self.inner.stop.cancel();
                    (self.take_hooks(), false)
                }
                Lifecycle::ShuttingDown => (Vec::new(), false),
                Lifecycle::Closed => return Err(ShutdownError::AlreadyClosed),
            }
        };

        for hook in hooks {
            hook();
        }
        if closed {
            return Ok(());
        }

        self.inner
            .logger
            .info(None, "Shutting down", &[field("grace", format!("{grace:?}"))]);

        let mut phase = self.inner.phase.subscribe();
        let waited = tokio::time::timeout(grace, phase.wait_for(|p| *p == Phase::Closed))
            .await
            .map(|_| ());
        match waited {
            Ok(()) => Ok(()),
            Err(_) => Err(ShutdownError::DeadlineExceeded {
                grace,
                active_connections: self.active_connections(),
            }),
        }
    }

    fn take_hooks(&self) -> Vec<ShutdownHook> {
        std::mem::take(&mut *self.lock_hooks())
    }

    fn lock_hooks(&self) -> MutexGuard<'_, Vec<ShutdownHook>> {
        self.inner
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: Lifecycle) {
        let mut state = self.lock();
        self.inner.phase.send_replace(next.phase());
        *state = next;
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.inner.address)
            .field("phase", &self.phase())
            .field("active_connections", &self.active_connections())
            .finish()
    }
}

fn is_aborted(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<ConnectionAborted>() {
            return true;
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::MemoryLogger;
    use tracing::Level;

    fn server() -> (Server, Arc<MemoryLogger>) {
        let logger = Arc::new(MemoryLogger::new());
        let options = ServerOptions::new().with_logger(logger.clone());
        let server = Server::new(CancellationToken::new(), "", options).unwrap();
        (server, logger)
    }

    #[test]
    fn logger_is_required() {
        let err = Server::new(CancellationToken::new(), "", ServerOptions::new()).unwrap_err();
        assert!(matches!(err, ServerError::MissingLogger));
    }

    #[test]
    fn route_validation() {
        let (server, logger) = server();
        server.add_route(Method::GET, "/a", || async { "a" }).unwrap();

        assert!(matches!(
            server.add_route(Method::GET, "/a", || async { "again" }),
            Err(ServerError::DuplicateRoute { .. })
        ));
        assert!(matches!(
            server.add_route(Method::GET, "relative", || async { "" }),
            Err(ServerError::InvalidPath { .. })
        ));
        let purge = Method::from_bytes(b"PURGE").unwrap();
        assert!(matches!(
            server.add_route(purge, "/cache", || async { "" }),
            Err(ServerError::UnsupportedMethod { .. })
        ));
        // Same path, different method is fine.
        server.add_route(Method::POST, "/a", || async { "posted" }).unwrap();
        assert_eq!(logger.at_level(Level::ERROR).len(), 3);
    }

    #[tokio::test]
    async fn shutdown_of_idle_server_closes_it() {
        let (server, _) = server();
        server.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(server.phase(), Phase::Closed);

        assert!(matches!(
            server.shutdown(Duration::from_secs(1)).await,
            Err(ShutdownError::AlreadyClosed)
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(server.serve(listener).await, Err(ServeError::Closed)));
    }

    #[tokio::test]
    async fn shutdown_hooks_run_once_in_order() {
        let (server, _) = server();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second"] {
            let calls = calls.clone();
            server
                .on_shutdown(move || calls.lock().unwrap().push(name))
                .unwrap();
        }

        let mut phases = server.watch_phase();
        let serving = server.clone();
        let task = tokio::spawn(async move { serving.serve(listener).await });
        phases.wait_for(|p| *p == Phase::Serving).await.unwrap();
        assert!(calls.lock().unwrap().is_empty());

        let (a, b) = tokio::join!(
            server.shutdown(Duration::from_secs(2)),
            server.shutdown(Duration::from_secs(2))
        );
        a.unwrap();
        b.unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);

        assert!(matches!(
            server.on_shutdown(|| {}),
            Err(ServerError::ShutdownStarted)
        ));
    }

    #[tokio::test]
    async fn shutdown_hooks_run_for_idle_server() {
        let (server, _) = server();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ran.clone();
        server
            .on_shutdown(move || flag.store(true, std::sync::atomic::Ordering::SeqCst))
            .unwrap();
        server.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn listen_and_serve_requires_address() {
        let (server, _) = server();
        assert!(matches!(
            server.listen_and_serve().await,
            Err(ServeError::NoAddress)
        ));
    }

    #[tokio::test]
    async fn serve_then_shutdown_walks_every_phase() {
        let (server, logger) = server();
        let mut phases = server.watch_phase();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let serving = server.clone();
        let task = tokio::spawn(async move { serving.serve(listener).await });
        phases.wait_for(|p| *p == Phase::Serving).await.unwrap();

        assert!(matches!(
            server.add_route(Method::GET, "/late", || async { "" }),
            Err(ServerError::RoutesFrozen { .. })
        ));
        let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(
            server.serve(second).await,
            Err(ServeError::AlreadyStarted)
        ));

        server.shutdown(Duration::from_secs(2)).await.unwrap();
        assert_eq!(server.phase(), Phase::Closed);
        task.await.unwrap().unwrap();

        let rejected = logger.at_level(Level::ERROR);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].field_str("path"), Some("/late"));
    }
}
