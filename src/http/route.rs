//! Route definitions.
//!
//! A [`Route`] pairs a method and path with an axum handler and an ordered
//! list of per-route middleware. Routes are collected by the server while it
//! is idle and frozen once serving starts.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::Request;
use axum::handler::Handler;
use axum::http::Method;
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::{on, MethodFilter, MethodRouter};

/// Boxed future returned by a [`RouteMiddleware`].
pub type MiddlewareFuture = Pin<Box<dyn Future<Output = Response> + Send + 'static>>;

/// A per-route middleware stage. Runs after the global pipeline.
pub type RouteMiddleware = Arc<dyn Fn(Request, Next) -> MiddlewareFuture + Send + Sync>;

/// Wrap an async function as a [`RouteMiddleware`].
pub fn middleware<F, Fut>(f: F) -> RouteMiddleware
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |req, next| Box::pin(f(req, next)))
}

/// One entry of the route table.
pub struct Route {
    method: Method,
    path: String,
    endpoint: Option<MethodRouter>,
    middlewares: Vec<RouteMiddleware>,
}

impl Route {
    /// Build a route. Methods axum cannot filter on are reported when the
    /// route is registered.
    pub fn new<H, T>(method: Method, path: impl Into<String>, handler: H) -> Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        let endpoint = MethodFilter::try_from(method.clone())
            .ok()
            .map(|filter| on(filter, handler));
        Self {
            method,
            path: path.into(),
            endpoint,
            middlewares: Vec::new(),
        }
    }

    pub fn get<H, T>(path: impl Into<String>, handler: H) -> Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        Self::new(Method::GET, path, handler)
    }

    pub fn post<H, T>(path: impl Into<String>, handler: H) -> Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        Self::new(Method::POST, path, handler)
    }

    /// Append a middleware; the first one added runs first.
    pub fn with_middleware(mut self, middleware: RouteMiddleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Resolve into the axum method router with per-route middleware applied,
    /// or `None` if the method is not routable.
    pub(crate) fn into_endpoint(self) -> Option<MethodRouter> {
        let mut endpoint = self.endpoint?;
        // Last layer added is outermost, so walk back to front.
        for mw in self.middlewares.into_iter().rev() {
            endpoint = endpoint.layer(axum::middleware::from_fn(move |req: Request, next: Next| {
                let mw = Arc::clone(&mw);
                async move { mw(req, next).await }
            }));
        }
        Some(endpoint)
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}
