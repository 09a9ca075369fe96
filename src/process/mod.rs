//! Server process supervision subsystem.
//!
//! # Data Flow
//! ```text
//! WorldSpec + ServerType
//!     → supervisor.rs (LaunchPlan: executable, template, cwd, port)
//!     → control.rs (Launcher spawns, ServerProcess handle)
//!     → state.rs (phase transitions, logged)
//! ```

pub mod control;
pub mod state;
pub mod supervisor;

pub use control::{LaunchCommand, Launcher, ServerProcess, ShellLauncher};
pub use state::{ExitSummary, RuntimeWorldState, TransitionEvent, WorldPhase};
pub use supervisor::{
    CrashReport, LaunchError, LaunchPlan, ProcessSupervisor, StopOutcome, SupervisorError,
};
