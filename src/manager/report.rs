//! Per-world outcomes of manager operations.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::manager::WorldError;
use crate::manager::registry::RegistryEntry;
use crate::process::{RuntimeWorldState, StopOutcome, WorldPhase};

/// What an operation did to one world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Started { port: u16, pid: Option<u32> },
    Stopped { forced: bool, elapsed_ms: u64 },
    Restarted { port: u16, pid: Option<u32> },
    /// Nothing to stop.
    NotRunning,
    CommandSent,
}

impl From<StopOutcome> for Outcome {
    fn from(stop: StopOutcome) -> Self {
        Self::Stopped {
            forced: stop.is_forced(),
            elapsed_ms: stop.elapsed().as_millis() as u64,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started { port, .. } => write!(f, "started on port {}", port),
            Self::Restarted { port, .. } => write!(f, "restarted on port {}", port),
            Self::Stopped { forced: false, .. } => f.write_str("stopped"),
            Self::Stopped { forced: true, .. } => {
                f.write_str("stopped (killed after the graceful stop timed out)")
            }
            Self::NotRunning => f.write_str("not running"),
            Self::CommandSent => f.write_str("command sent"),
        }
    }
}

#[derive(Debug)]
pub struct WorldReport {
    pub world: String,
    pub result: Result<Outcome, WorldError>,
}

impl fmt::Display for WorldReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            Ok(outcome) => write!(f, "{}: {}", self.world, outcome),
            Err(e) => write!(f, "{}: failure: {}", self.world, e),
        }
    }
}

/// Outcomes of an operation applied to several worlds.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub reports: Vec<WorldReport>,
}

impl BatchReport {
    /// Pair each world with its result and log failures.
    pub fn from_results(names: &[String], results: Vec<Result<Outcome, WorldError>>) -> Self {
        let reports = names
            .iter()
            .cloned()
            .zip(results)
            .map(|(world, result)| {
                if let Err(e) = &result {
                    tracing::error!(world = %world, error = %e, "World operation failed");
                }
                WorldReport { world, result }
            })
            .collect();
        Self { reports }
    }

    pub fn is_success(&self) -> bool {
        self.reports.iter().all(|r| r.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &WorldReport> {
        self.reports.iter().filter(|r| r.result.is_err())
    }

    pub fn get(&self, world: &str) -> Option<&WorldReport> {
        self.reports.iter().find(|r| r.world == world)
    }
}

/// Result of replacing a server executable.
#[derive(Debug)]
pub struct UpdateReport {
    pub server: String,
    /// Worlds stopped for the update.
    pub stopped: BatchReport,
    /// `None` when the download was skipped because a world did not stop.
    pub download: Option<Result<PathBuf, WorldError>>,
    /// Worlds started again afterwards.
    pub restarted: BatchReport,
}

impl UpdateReport {
    pub fn is_success(&self) -> bool {
        self.stopped.is_success()
            && self.restarted.is_success()
            && matches!(self.download, Some(Ok(_)))
    }
}

/// Result of removing a server type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UninstallReport {
    pub server: String,
    pub replacement: String,
    /// Worlds now running `replacement`.
    pub worlds: Vec<String>,
    pub executable_removed: bool,
}

/// Snapshot of a world for `status`.
#[derive(Debug, Clone, Serialize)]
pub struct WorldStatus {
    /// State as seen by this manager.
    pub local: RuntimeWorldState,
    /// Entry in the runtime registry, possibly owned by another manager.
    pub registered: Option<RegistryEntry>,
    /// Registered, but the manager that started it is gone.
    pub orphaned: bool,
}

impl WorldStatus {
    pub fn new(local: RuntimeWorldState, registered: Option<RegistryEntry>) -> Self {
        let orphaned = registered.as_ref().is_some_and(RegistryEntry::is_orphaned);
        Self {
            local,
            registered,
            orphaned,
        }
    }

    pub fn is_online(&self) -> bool {
        self.local.phase.has_process() || self.registered.is_some()
    }

    /// Phase to display: the local one, or Running for worlds another
    /// manager serves.
    pub fn phase(&self) -> WorldPhase {
        match (&self.registered, self.local.phase) {
            (Some(_), WorldPhase::Stopped) => WorldPhase::Running,
            (_, phase) => phase,
        }
    }

    pub fn port(&self) -> Option<u16> {
        self.local
            .port
            .filter(|_| self.local.phase.has_process())
            .or_else(|| self.registered.as_ref().map(|e| e.port))
    }
}
