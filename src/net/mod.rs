//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bind, accept error classification, backoff)
//!     → connection.rs (lifecycle tracking)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Transient accept errors never stop the server
//! - Each connection tracked for graceful shutdown

pub mod connection;
pub mod listener;
