//! Resilience helpers for calls that leave the host.
//!
//! # Data Flow
//! ```text
//! Executable download:
//!     → attempt 0 immediately
//!     → on failure: backoff.rs (exponential delay + jitter), retry
//!     → give up after BackoffPolicy::attempts
//! ```

pub mod backoff;

pub use backoff::BackoffPolicy;
