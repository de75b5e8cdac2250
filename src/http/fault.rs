//! Fault boundary for request handling.
//!
//! # Responsibilities
//! - Drive a future and turn any panic raised while polling it into a
//!   [`HandlerFault`] value
//! - Capture the panic location, and the backtrace when the boundary asks
//!   for it, through a process panic hook
//! - Tell a client that went away (broken pipe) apart from a real bug
//!
//! # Design Decisions
//! - Panics are caught per poll, so a fault surfaces at the exact `.await`
//!   that produced it
//! - The hook only swallows panics raised inside a boundary; everything else
//!   goes to the previously installed hook untouched
//! - Classification walks `source()` chains, never string-matches the panic
//!   message itself

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};

thread_local! {
    static BOUNDARY_DEPTH: Cell<usize> = const { Cell::new(0) };
    static CAPTURE_BACKTRACE: Cell<bool> = const { Cell::new(false) };
    static LAST_SITE: RefCell<Option<FaultSite>> = const { RefCell::new(None) };
}

/// Where a caught panic was raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultSite {
    /// `file:line:column` of the panic.
    pub location: String,
    /// Rendered backtrace, when the boundary captured one.
    pub backtrace: Option<String>,
}

/// A fault raised by the code running inside a [`CatchFault`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerFault {
    /// The peer closed the connection while we were still writing to it.
    BrokenPipe { message: String },
    /// Any other panic.
    Panic {
        message: String,
        site: Option<FaultSite>,
    },
}

impl HandlerFault {
    pub fn message(&self) -> &str {
        match self {
            Self::BrokenPipe { message } | Self::Panic { message, .. } => message,
        }
    }

    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, Self::BrokenPipe { .. })
    }

    /// Metric label for this kind of fault.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BrokenPipe { .. } => "broken_pipe",
            Self::Panic { .. } => "panic",
        }
    }

    /// Classify a panic payload.
    ///
    /// `io::Error` and boxed error payloads are checked for a broken pipe;
    /// string payloads are plain panics.
    pub fn from_payload(payload: Box<dyn Any + Send>, site: Option<FaultSite>) -> Self {
        let payload = match payload.downcast::<io::Error>() {
            Ok(err) => return Self::from_error(&*err, site),
            Err(payload) => payload,
        };
        let payload = match payload.downcast::<Box<dyn Error + Send + Sync>>() {
            Ok(err) => {
                let err: &(dyn Error + 'static) = &**err;
                return Self::from_error(err, site);
            }
            Err(payload) => payload,
        };

        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Box<dyn Any>".to_string()
        };
        Self::Panic { message, site }
    }

    fn from_error(err: &(dyn Error + 'static), site: Option<FaultSite>) -> Self {
        let message = err.to_string();
        if is_broken_pipe(err) {
            Self::BrokenPipe { message }
        } else {
            Self::Panic { message, site }
        }
    }
}

impl fmt::Display for HandlerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// True if `err`, or anything in its source chain, means the peer is gone.
pub fn is_broken_pipe(err: &(dyn Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
            ) {
                return true;
            }
        }
        let text = e.to_string().to_ascii_lowercase();
        if text.contains("broken pipe") || text.contains("connection reset by peer") {
            return true;
        }
        current = e.source();
    }
    false
}

/// Install the panic hook that records fault sites. Idempotent.
pub fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if BOUNDARY_DEPTH.try_with(Cell::get).unwrap_or(0) == 0 {
                previous(info);
                return;
            }
            let site = FaultSite {
                location: info
                    .location()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
                backtrace: CAPTURE_BACKTRACE
                    .try_with(Cell::get)
                    .unwrap_or(false)
                    .then(|| Backtrace::force_capture().to_string()),
            };
            let _ = LAST_SITE.try_with(|slot| *slot.borrow_mut() = Some(site));
        }));
    });
}

struct BoundaryGuard {
    outer_capture: bool,
}

impl BoundaryGuard {
    fn enter(capture: bool) -> Self {
        BOUNDARY_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            outer_capture: CAPTURE_BACKTRACE.with(|c| c.replace(capture)),
        }
    }
}

impl Drop for BoundaryGuard {
    fn drop(&mut self) {
        BOUNDARY_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
        CAPTURE_BACKTRACE.with(|c| c.set(self.outer_capture));
    }
}

fn take_site() -> Option<FaultSite> {
    LAST_SITE.try_with(|slot| slot.borrow_mut().take()).ok().flatten()
}

/// Future adapter that converts panics of the inner future into `Err`.
pub struct CatchFault<F> {
    inner: Pin<Box<F>>,
    backtrace: bool,
}

impl<F: Future> CatchFault<F> {
    pub fn new(future: F) -> Self {
        Self {
            inner: Box::pin(future),
            backtrace: true,
        }
    }

    /// Whether the panic hook renders a backtrace for faults in this boundary.
    pub fn with_backtrace(mut self, enable: bool) -> Self {
        self.backtrace = enable;
        self
    }
}

impl<F: Future> Future for CatchFault<F> {
    type Output = Result<F::Output, HandlerFault>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let capture = this.backtrace;
        let inner = this.inner.as_mut();
        let polled = {
            let _boundary = BoundaryGuard::enter(capture);
            panic::catch_unwind(AssertUnwindSafe(|| inner.poll(cx)))
        };
        match polled {
            Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(HandlerFault::from_payload(payload, take_site()))),
        }
    }
}

/// Run `future` inside a fault boundary.
pub fn catch_fault<F: Future>(future: F) -> CatchFault<F> {
    CatchFault::new(future)
}
