//! Per-world process supervision.
//!
//! # Responsibilities
//! - Launch a world's server from its start command template
//! - Run the graceful stop protocol, escalating to a kill on timeout when
//!   asked to
//! - Notice unexpected exits and report them as crashes
//!
//! # Stop protocol
//! ```text
//! Running → Stopping
//!     "say <line>" for every stop_message line
//!     wait stop_delay (ends early if the process exits)
//!     "stop"
//!     wait stop_timeout
//!     still alive, forced   → kill process group (GracefulStopTimeout) → Stopped
//!     still alive, unforced → StopTimedOut, back to Running
//! → Stopped
//! ```
//!
//! # Design Decisions
//! - The supervisor owns the process handle; nobody else can signal it
//! - Calls that do not fit the current phase fail without side effects
//! - A forced stop always ends in Stopped, whatever the process does

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;

use crate::config::template::StartTemplate;
use crate::config::WorldSpec;
use crate::process::control::{LaunchCommand, Launcher, ServerProcess};
use crate::process::state::{ExitSummary, RuntimeWorldState, TransitionEvent, WorldPhase};

/// Console command used to broadcast the stop message.
pub const SAY_COMMAND: &str = "say";

/// Console command asking the server to shut down.
pub const STOP_COMMAND: &str = "stop";

/// How long a fresh process must survive to count as started.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("server executable {} is missing", path.display())]
    ExecutableMissing { path: PathBuf },

    #[error("failed to launch '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("world '{world}' cannot {action} while {phase}")]
    InvalidTransition {
        world: String,
        action: &'static str,
        phase: WorldPhase,
    },

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("world '{world}' did not stop within {stop_timeout}s and is still running")]
    StopTimedOut { world: String, stop_timeout: u64 },

    #[error("world '{world}' console write failed: {source}")]
    Console {
        world: String,
        #[source]
        source: io::Error,
    },
}

/// Everything `start` needs besides the world definition.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub executable: PathBuf,
    pub template: StartTemplate,
    pub cwd: PathBuf,
    pub port: u16,
}

/// How a stop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process exited on its own.
    Graceful { exit: ExitSummary, elapsed: Duration },
    /// stop_timeout elapsed and the process was killed.
    Forced {
        exit: Option<ExitSummary>,
        elapsed: Duration,
    },
}

impl StopOutcome {
    pub fn is_forced(&self) -> bool {
        matches!(self, Self::Forced { .. })
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Graceful { elapsed, .. } | Self::Forced { elapsed, .. } => *elapsed,
        }
    }
}

/// An exit nobody asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    pub world: String,
    pub exit: ExitSummary,
    pub port: Option<u16>,
}

/// Supervises the server process of one world.
pub struct ProcessSupervisor<L: Launcher> {
    world: WorldSpec,
    launcher: Arc<L>,
    state: RuntimeWorldState,
    observer: watch::Sender<RuntimeWorldState>,
    process: Option<L::Process>,
    startup_grace: Duration,
}

impl<L: Launcher> ProcessSupervisor<L> {
    pub fn new(world: WorldSpec, launcher: Arc<L>) -> Self {
        let state = RuntimeWorldState::new(&world.name);
        let (observer, _) = watch::channel(state.clone());
        Self {
            world,
            launcher,
            state,
            observer,
            process: None,
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    pub fn world(&self) -> &WorldSpec {
        &self.world
    }

    pub fn state(&self) -> &RuntimeWorldState {
        &self.state
    }

    pub fn phase(&self) -> WorldPhase {
        self.state.phase
    }

    /// Follow state changes without locking the supervisor.
    pub fn subscribe(&self) -> watch::Receiver<RuntimeWorldState> {
        self.observer.subscribe()
    }

    /// Swap in a freshly loaded world definition. Valid only while Stopped.
    pub fn reconfigure(&mut self, world: WorldSpec) -> Result<(), SupervisorError> {
        self.expect_phase(WorldPhase::Stopped, "be reconfigured")?;
        self.world = world;
        Ok(())
    }

    /// Launch the server. Valid only while Stopped.
    pub async fn start(&mut self, plan: &LaunchPlan) -> Result<(), SupervisorError> {
        self.expect_phase(WorldPhase::Stopped, "start")?;

        if !plan.executable.is_file() {
            return Err(LaunchError::ExecutableMissing {
                path: plan.executable.clone(),
            }
            .into());
        }
        let executable = std::path::absolute(&plan.executable).map_err(|e| {
            LaunchError::SpawnFailed {
                command: plan.template.to_string(),
                reason: e.to_string(),
            }
        })?;
        let command = LaunchCommand {
            world: self.world.name.clone(),
            command: plan.template.expand(&executable),
            cwd: plan.cwd.clone(),
            port: plan.port,
        };

        self.transition(WorldPhase::Starting, TransitionEvent::StartRequested)?;

        if let Err(e) = tokio::fs::create_dir_all(&command.cwd).await {
            return Err(self.launch_failed(&command, e.to_string()));
        }

        let mut process = match self.launcher.launch(&command) {
            Ok(process) => process,
            Err(e) => return Err(self.launch_failed(&command, e.to_string())),
        };

        match process.wait_timeout(self.startup_grace).await {
            Ok(None) => {
                self.state.pid = process.pid();
                self.state.port = Some(plan.port);
                self.process = Some(process);
                self.transition(WorldPhase::Running, TransitionEvent::ProcessAlive)?;
                tracing::info!(
                    world = %self.world.name,
                    pid = ?self.state.pid,
                    port = plan.port,
                    "World started"
                );
                Ok(())
            }
            Ok(Some(status)) => {
                let exit = ExitSummary::from(status);
                self.state.last_exit = Some(exit);
                Err(self.launch_failed(&command, format!("exited during startup ({})", exit)))
            }
            Err(e) => {
                if let Err(kill_err) = process.kill().await {
                    tracing::warn!(world = %self.world.name, error = %kill_err, "Failed to kill unconfirmed process");
                }
                Err(self.launch_failed(&command, e.to_string()))
            }
        }
    }

    /// Run the graceful stop protocol, killing the process if it outlives
    /// stop_timeout. Valid only while Running.
    pub async fn stop(&mut self) -> Result<StopOutcome, SupervisorError> {
        self.stop_with(true).await
    }

    /// Like `stop`, but unless `force` is set a process that outlives
    /// stop_timeout is left running and the world returns to Running.
    pub async fn stop_with(&mut self, force: bool) -> Result<StopOutcome, SupervisorError> {
        self.poll();
        self.expect_phase(WorldPhase::Running, "stop")?;
        let Some(mut process) = self.process.take() else {
            return Err(self.invalid("stop"));
        };

        self.transition(WorldPhase::Stopping, TransitionEvent::StopRequested)?;
        let started = Instant::now();

        for line in self.world.stop_message.lines().filter(|l| !l.trim().is_empty()) {
            let say = format!("{} {}", SAY_COMMAND, line.trim());
            if let Err(e) = process.send_line(&say).await {
                tracing::warn!(world = %self.world.name, error = %e, "Could not send stop message");
                break;
            }
        }

        let mut exited = wait_quietly(&mut process, self.world.stop_delay(), &self.world.name).await;
        if exited.is_none() {
            if let Err(e) = process.send_line(STOP_COMMAND).await {
                tracing::warn!(world = %self.world.name, error = %e, "Could not send stop command");
            }
            exited = wait_quietly(&mut process, self.world.stop_timeout(), &self.world.name).await;
        }

        let outcome = match exited {
            Some(status) => {
                let exit = ExitSummary::from(status);
                self.finish_stop(Some(exit), TransitionEvent::ExitedGracefully)?;
                StopOutcome::Graceful {
                    exit,
                    elapsed: started.elapsed(),
                }
            }
            None if !force => {
                tracing::warn!(
                    world = %self.world.name,
                    stop_timeout = self.world.stop_timeout,
                    "World did not stop, leaving it running"
                );
                self.process = Some(process);
                self.transition(WorldPhase::Running, TransitionEvent::StopTimedOut)?;
                return Err(SupervisorError::StopTimedOut {
                    world: self.world.name.clone(),
                    stop_timeout: self.world.stop_timeout,
                });
            }
            None => {
                tracing::warn!(
                    world = %self.world.name,
                    stop_timeout = self.world.stop_timeout,
                    "GracefulStopTimeout: killing server process"
                );
                let exit = match process.kill().await {
                    Ok(status) => Some(ExitSummary::from(status)),
                    Err(e) => {
                        tracing::error!(world = %self.world.name, error = %e, "Kill failed");
                        None
                    }
                };
                self.finish_stop(exit, TransitionEvent::ForcedKill)?;
                StopOutcome::Forced {
                    exit,
                    elapsed: started.elapsed(),
                }
            }
        };

        tracing::info!(
            world = %self.world.name,
            forced = outcome.is_forced(),
            elapsed_ms = outcome.elapsed().as_millis() as u64,
            "World stopped"
        );
        Ok(outcome)
    }

    /// Check a Running world for an exit nobody asked for.
    pub fn poll(&mut self) -> Option<CrashReport> {
        if self.state.phase != WorldPhase::Running {
            return None;
        }
        let process = self.process.as_mut()?;
        let status = match process.try_exit() {
            Ok(Some(status)) => status,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(world = %self.world.name, error = %e, "Exit check failed");
                return None;
            }
        };

        let exit = ExitSummary::from(status);
        self.process = None;
        self.state.pid = None;
        self.state.last_exit = Some(exit);
        if self
            .transition(WorldPhase::Crashed, TransitionEvent::UnexpectedExit)
            .is_err()
        {
            return None;
        }
        tracing::warn!(world = %self.world.name, exit = %exit, "World crashed");
        Some(CrashReport {
            world: self.world.name.clone(),
            exit,
            port: self.state.port,
        })
    }

    /// Acknowledge a crash: Crashed → Stopped.
    pub fn settle(&mut self) -> Result<(), SupervisorError> {
        self.expect_phase(WorldPhase::Crashed, "settle")?;
        self.transition(WorldPhase::Stopped, TransitionEvent::CrashReported)
    }

    /// Write a line to the console of a Running world.
    pub async fn send_command(&mut self, line: &str) -> Result<(), SupervisorError> {
        self.expect_phase(WorldPhase::Running, "receive commands")?;
        let Some(process) = self.process.as_mut() else {
            return Err(self.invalid("receive commands"));
        };
        process
            .send_line(line)
            .await
            .map_err(|source| SupervisorError::Console {
                world: self.world.name.clone(),
                source,
            })
    }

    fn finish_stop(
        &mut self,
        exit: Option<ExitSummary>,
        event: TransitionEvent,
    ) -> Result<(), SupervisorError> {
        self.state.pid = None;
        self.state.last_exit = exit;
        self.transition(WorldPhase::Stopped, event)
    }

    fn launch_failed(&mut self, command: &LaunchCommand, reason: String) -> SupervisorError {
        if let Err(e) = self.transition(WorldPhase::Stopped, TransitionEvent::LaunchFailed) {
            tracing::error!(error = %e, "Unexpected phase after failed launch");
        }
        tracing::error!(world = %self.world.name, reason = %reason, "Launch failed");
        LaunchError::SpawnFailed {
            command: command.command.clone(),
            reason,
        }
        .into()
    }

    fn expect_phase(&self, phase: WorldPhase, action: &'static str) -> Result<(), SupervisorError> {
        if self.state.phase == phase {
            Ok(())
        } else {
            Err(self.invalid(action))
        }
    }

    fn invalid(&self, action: &'static str) -> SupervisorError {
        SupervisorError::InvalidTransition {
            world: self.world.name.clone(),
            action,
            phase: self.state.phase,
        }
    }

    fn transition(&mut self, next: WorldPhase, event: TransitionEvent) -> Result<(), SupervisorError> {
        self.state
            .transition(next, event)
            .map_err(|phase| SupervisorError::InvalidTransition {
                world: self.world.name.clone(),
                action: "change phase",
                phase,
            })?;
        self.observer.send_replace(self.state.clone());
        Ok(())
    }
}

/// Wait for exit, treating wait errors as "still running".
async fn wait_quietly<P: ServerProcess>(
    process: &mut P,
    timeout: Duration,
    world: &str,
) -> Option<std::process::ExitStatus> {
    match process.wait_timeout(timeout).await {
        Ok(status) => status,
        Err(e) => {
            tracing::warn!(world = %world, error = %e, "Waiting for exit failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortSetting;
    use crate::process::control::ShellLauncher;
    use std::path::Path;

    const COOPERATIVE: &str = "\
while read line; do
  echo \"$line\" >> console.log
  if [ \"$line\" = stop ]; then exit 0; fi
done
";

    const STUBBORN: &str = "\
trap '' TERM INT
while true; do sleep 1; done
";

    fn world(stop_delay: u64, stop_timeout: u64) -> WorldSpec {
        WorldSpec {
            name: "foo".to_string(),
            port: PortSetting::Fixed(41300),
            stop_timeout,
            stop_message: "Bye\nSee you soon".to_string(),
            stop_delay,
            server: "script".to_string(),
        }
    }

    fn plan(dir: &Path, script: &str) -> LaunchPlan {
        let executable = dir.join("server.sh");
        std::fs::write(&executable, script).unwrap();
        LaunchPlan {
            executable,
            template: StartTemplate::parse("sh {server}").unwrap(),
            cwd: dir.join("worlds").join("foo"),
            port: 41300,
        }
    }

    fn supervisor(world: WorldSpec) -> ProcessSupervisor<ShellLauncher> {
        ProcessSupervisor::new(world, Arc::new(ShellLauncher))
            .with_startup_grace(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_start_and_graceful_stop() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), COOPERATIVE);
        let mut sup = supervisor(world(0, 5));

        sup.start(&plan).await.unwrap();
        assert_eq!(sup.phase(), WorldPhase::Running);
        assert!(sup.state().pid.is_some());
        assert_eq!(sup.state().port, Some(41300));

        let outcome = sup.stop().await.unwrap();
        assert!(!outcome.is_forced());
        assert_eq!(sup.phase(), WorldPhase::Stopped);
        assert_eq!(sup.state().pid, None);

        let console = std::fs::read_to_string(plan.cwd.join("console.log")).unwrap();
        assert_eq!(console, "say Bye\nsay See you soon\nstop\n");
    }

    #[tokio::test]
    async fn test_stubborn_process_is_killed_within_bound() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), STUBBORN);
        let mut sup = supervisor(world(0, 1));

        sup.start(&plan).await.unwrap();
        let started = Instant::now();
        let outcome = sup.stop().await.unwrap();

        assert!(outcome.is_forced());
        assert_eq!(sup.phase(), WorldPhase::Stopped);
        assert_eq!(sup.state().last_event, Some(TransitionEvent::ForcedKill));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_unforced_stop_leaves_stubborn_process_running() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), STUBBORN);
        let mut sup = supervisor(world(0, 1));

        sup.start(&plan).await.unwrap();
        let pid = sup.state().pid;

        let err = sup.stop_with(false).await.unwrap_err();
        assert!(matches!(err, SupervisorError::StopTimedOut { stop_timeout: 1, .. }));
        assert_eq!(sup.phase(), WorldPhase::Running);
        assert_eq!(sup.state().pid, pid);
        assert_eq!(sup.state().last_event, Some(TransitionEvent::StopTimedOut));
        assert!(sup.poll().is_none());

        let outcome = sup.stop().await.unwrap();
        assert!(outcome.is_forced());
        assert_eq!(sup.phase(), WorldPhase::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_transitions_leave_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), COOPERATIVE);
        let mut sup = supervisor(world(0, 5));

        let err = sup.stop().await.unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidTransition { phase: WorldPhase::Stopped, .. }));
        assert_eq!(sup.phase(), WorldPhase::Stopped);
        assert!(sup.settle().is_err());

        sup.start(&plan).await.unwrap();
        let before = sup.state().clone();
        let err = sup.start(&plan).await.unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidTransition { phase: WorldPhase::Running, .. }));
        assert_eq!(sup.phase(), WorldPhase::Running);
        assert_eq!(sup.state().pid, before.pid);
        assert_eq!(sup.state().since, before.since);

        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let mut plan = plan(dir.path(), COOPERATIVE);
        plan.executable = dir.path().join("absent.jar");
        let mut sup = supervisor(world(0, 5));

        let err = sup.start(&plan).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Launch(LaunchError::ExecutableMissing { .. })));
        assert_eq!(sup.phase(), WorldPhase::Stopped);
    }

    #[tokio::test]
    async fn test_immediate_exit_is_a_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), "exit 1\n");
        let mut sup = supervisor(world(0, 5));

        let err = sup.start(&plan).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Launch(LaunchError::SpawnFailed { .. })));
        assert_eq!(sup.phase(), WorldPhase::Stopped);
        assert_eq!(sup.state().last_exit.and_then(|e| e.code), Some(1));
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_reported_as_crash() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), "sleep 1\nexit 3\n");
        let mut sup = supervisor(world(0, 5));

        sup.start(&plan).await.unwrap();
        assert!(sup.poll().is_none());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let report = sup.poll().unwrap();
        assert_eq!(report.exit.code, Some(3));
        assert_eq!(sup.phase(), WorldPhase::Crashed);

        // No restart, no stop: only the acknowledgement is accepted.
        assert!(sup.stop().await.is_err());
        sup.settle().unwrap();
        assert_eq!(sup.phase(), WorldPhase::Stopped);
    }

    #[tokio::test]
    async fn test_observers_see_every_phase() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), COOPERATIVE);
        let mut sup = supervisor(world(0, 5));
        let observer = sup.subscribe();
        assert_eq!(observer.borrow().phase, WorldPhase::Stopped);

        sup.start(&plan).await.unwrap();
        assert_eq!(observer.borrow().phase, WorldPhase::Running);
        assert_eq!(observer.borrow().port, Some(41300));
        assert!(sup.reconfigure(world(1, 5)).is_err());

        sup.stop().await.unwrap();
        assert_eq!(observer.borrow().phase, WorldPhase::Stopped);
        assert_eq!(observer.borrow().pid, None);

        sup.reconfigure(world(1, 5)).unwrap();
        assert_eq!(sup.world().stop_delay, 1);
    }

    #[tokio::test]
    async fn test_send_command() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), COOPERATIVE);
        let mut sup = supervisor(world(0, 5));

        assert!(sup.send_command("list").await.is_err());
        sup.start(&plan).await.unwrap();
        sup.send_command("list").await.unwrap();
        sup.stop().await.unwrap();

        let console = std::fs::read_to_string(plan.cwd.join("console.log")).unwrap();
        assert!(console.starts_with("list\n"));
    }
}
