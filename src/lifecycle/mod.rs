//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Switch to the configured user → Build the WorldManager
//!
//! Mutation of shared state (lock.rs):
//!     acquire(timeout) → LockGuard → config/port/registry writes → drop
//!
//! Signals (signals.rs) and shutdown (shutdown.rs):
//!     SIGTERM/SIGINT → stop every supervised world → exit
//!     SIGHUP → restart every supervised world
//! ```
//!
//! # Design Decisions
//! - The lock lives on disk so separate manager processes see it
//! - Background tasks subscribe to one shutdown broadcast

pub mod lock;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use lock::{InstanceLock, LockError, LockGuard};
pub use shutdown::Shutdown;
