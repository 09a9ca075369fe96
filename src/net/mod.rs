//! Network subsystem.
//!
//! # Data Flow
//! ```text
//! WorldManager::start (instance lock held)
//!     → port.rs (fixed port, persisted port, or range scan + bind probe)
//!     → worlds.conf updated for <auto> worlds
//!     → port handed to the world's server process
//! ```
//!
//! # Design Decisions
//! - Ports are only probed, never held: the server binds them itself
//! - Uniqueness comes from the lock-guarded scan, the probe only catches
//!   processes the manager does not know about

pub mod port;

pub use port::{PortAllocator, PortError};
