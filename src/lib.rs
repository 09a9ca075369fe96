//! Minecraft world and server manager.
//!
//! Runs several Minecraft worlds on one host: resolves their configuration,
//! hands out ports, supervises the server processes and keeps concurrent
//! manager invocations from stepping on each other.

// Core subsystems
pub mod config;
pub mod manager;
pub mod net;
pub mod process;
pub mod provision;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::{load_config, Configuration, InstancePaths};
pub use lifecycle::Shutdown;
pub use manager::{BatchReport, CrashMonitor, Outcome, WorldError, WorldManager};
pub use process::ShellLauncher;
pub use provision::HttpFetcher;
