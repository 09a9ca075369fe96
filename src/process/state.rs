//! World lifecycle state machine.
//!
//! # States
//! - Stopped: no process
//! - Starting: spawn issued, waiting to see the process stay alive
//! - Running: process alive and owned by the supervisor
//! - Stopping: graceful stop protocol in progress
//! - Crashed: process exited without being asked to
//!
//! # State Transitions
//! ```text
//! Stopped  → Starting: start requested
//! Starting → Running:  process alive after the startup grace
//! Starting → Stopped:  launch failed
//! Running  → Stopping: stop requested
//! Stopping → Stopped:  process exited (voluntarily or killed)
//! Running  → Crashed:  unexpected exit observed
//! Crashed  → Stopped:  crash reported
//! ```

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorldPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl WorldPhase {
    pub fn can_transition_to(self, next: WorldPhase) -> bool {
        use WorldPhase::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Running, Crashed)
                | (Stopping, Stopped)
                | (Stopping, Running)
                | (Crashed, Stopped)
        )
    }

    /// A process exists (or may exist) in this phase.
    pub fn has_process(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl fmt::Display for WorldPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// What triggered a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionEvent {
    StartRequested,
    ProcessAlive,
    LaunchFailed,
    StopRequested,
    ExitedGracefully,
    ForcedKill,
    StopTimedOut,
    UnexpectedExit,
    CrashReported,
}

/// Exit status in a form that can be printed and serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitSummary {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitSummary {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown exit"),
        }
    }
}

/// Mutable per-world state, owned by the world's supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeWorldState {
    pub world: String,
    pub phase: WorldPhase,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub last_exit: Option<ExitSummary>,
    pub last_event: Option<TransitionEvent>,
    /// Unix time of the last transition.
    pub since: u64,
}

impl RuntimeWorldState {
    pub fn new(world: &str) -> Self {
        Self {
            world: world.to_string(),
            phase: WorldPhase::Stopped,
            port: None,
            pid: None,
            last_exit: None,
            last_event: None,
            since: unix_now(),
        }
    }

    /// Move to `next`, logging the change. Refused moves change nothing.
    pub(crate) fn transition(
        &mut self,
        next: WorldPhase,
        event: TransitionEvent,
    ) -> Result<(), WorldPhase> {
        if !self.phase.can_transition_to(next) {
            return Err(self.phase);
        }
        let previous = self.phase;
        self.phase = next;
        self.last_event = Some(event);
        self.since = unix_now();
        tracing::info!(
            world = %self.world,
            from = %previous,
            to = %next,
            event = ?event,
            at = self.since,
            "World phase changed"
        );
        Ok(())
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_lifecycle() {
        let mut state = RuntimeWorldState::new("foo");
        state.transition(WorldPhase::Starting, TransitionEvent::StartRequested).unwrap();
        state.transition(WorldPhase::Running, TransitionEvent::ProcessAlive).unwrap();
        state.transition(WorldPhase::Stopping, TransitionEvent::StopRequested).unwrap();
        state.transition(WorldPhase::Stopped, TransitionEvent::ExitedGracefully).unwrap();
        assert_eq!(state.phase, WorldPhase::Stopped);
        assert_eq!(state.last_event, Some(TransitionEvent::ExitedGracefully));
    }

    #[test]
    fn test_crash_path() {
        let mut state = RuntimeWorldState::new("foo");
        state.transition(WorldPhase::Starting, TransitionEvent::StartRequested).unwrap();
        state.transition(WorldPhase::Running, TransitionEvent::ProcessAlive).unwrap();
        state.transition(WorldPhase::Crashed, TransitionEvent::UnexpectedExit).unwrap();
        assert!(!state.phase.has_process());
        state.transition(WorldPhase::Stopped, TransitionEvent::CrashReported).unwrap();
    }

    #[test]
    fn test_invalid_transition_changes_nothing() {
        let mut state = RuntimeWorldState::new("foo");
        let before = state.clone();
        assert_eq!(
            state.transition(WorldPhase::Stopping, TransitionEvent::StopRequested),
            Err(WorldPhase::Stopped)
        );
        assert_eq!(state.phase, before.phase);
        assert_eq!(state.last_event, before.last_event);
        assert!(!WorldPhase::Running.can_transition_to(WorldPhase::Starting));
        assert!(!WorldPhase::Crashed.can_transition_to(WorldPhase::Running));
        assert!(WorldPhase::Stopping.can_transition_to(WorldPhase::Running));
    }

    #[test]
    fn test_exit_summary() {
        let ok = ExitSummary::from(ExitStatus::from_raw(0));
        assert_eq!(ok.code, Some(0));
        assert_eq!(ok.to_string(), "exit code 0");

        let killed = ExitSummary::from(ExitStatus::from_raw(9));
        assert_eq!(killed.signal, Some(9));
        assert_eq!(killed.to_string(), "signal 9");
    }
}
