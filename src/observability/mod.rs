//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields (world, port, phase, pid)
//!     → server console output forwarded at debug level
//!
//! Consumers:
//!     → logging.rs (fmt layer on stderr, filtered by loglevel / RUST_LOG)
//! ```

pub mod logging;
