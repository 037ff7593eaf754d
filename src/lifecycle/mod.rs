//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → servers stop accepting → open streams drain → exit
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, drop the upstream pool
//! - Draining has a deadline; streams still open after it are cut off

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
