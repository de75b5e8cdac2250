//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Resolve config → Build server → Register routes → Bind listener
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Cancel root token
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain connections → Exit
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then server, then listener
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has a deadline: reported as an error, never waited out

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{run, RunError};
