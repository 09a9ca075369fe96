//! Operating-system process control.
//!
//! # Responsibilities
//! - Spawn a world's server with its working directory and console pipe
//! - Write console lines, poll and wait for exit, force-kill
//! - Signal servers left behind by a manager that died
//!
//! # Design Decisions
//! - The supervisor only sees the `Launcher`/`ServerProcess` traits
//! - Commands run through `sh -c "exec ..."` so the shell is replaced by
//!   the server and the pid we hold is the server's
//! - Every server gets its own session (`setsid`); force-kill signals the
//!   whole process group so wrapper scripts cannot leave orphans behind
//! - Server output is forwarded to tracing at debug level

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};

/// Fully expanded launch request for one world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub world: String,
    /// Shell command line, `{server}` already substituted.
    pub command: String,
    pub cwd: PathBuf,
    pub port: u16,
}

/// A running server process as the supervisor sees it.
pub trait ServerProcess: Send + 'static {
    fn pid(&self) -> Option<u32>;

    /// Write one line to the server console.
    fn send_line(&mut self, line: &str) -> impl Future<Output = io::Result<()>> + Send;

    /// Non-blocking exit check.
    fn try_exit(&mut self) -> io::Result<Option<ExitStatus>>;

    /// Wait for the process to exit; `None` if it is still alive after `timeout`.
    fn wait_timeout(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = io::Result<Option<ExitStatus>>> + Send;

    /// Kill the process and reap it.
    fn kill(&mut self) -> impl Future<Output = io::Result<ExitStatus>> + Send;
}

/// Creates server processes.
pub trait Launcher: Send + Sync + 'static {
    type Process: ServerProcess;

    fn launch(&self, command: &LaunchCommand) -> io::Result<Self::Process>;
}

/// Launches servers as children of the manager through `/bin/sh`.
#[derive(Debug, Clone, Default)]
pub struct ShellLauncher;

impl Launcher for ShellLauncher {
    type Process = ChildProcess;

    fn launch(&self, command: &LaunchCommand) -> io::Result<ChildProcess> {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(format!("exec {}", command.command))
            .current_dir(&command.cwd)
            .env("EMSM_WORLD", &command.world)
            .env("EMSM_PORT", command.port.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // SAFETY: setsid is async-signal-safe and touches no parent state.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();
        tracing::debug!(world = %command.world, pid = ?pid, command = %command.command, "Spawned server process");

        if let Some(stdout) = child.stdout.take() {
            forward_output(command.world.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(command.world.clone(), "stderr", stderr);
        }

        Ok(ChildProcess {
            stdin: child.stdin.take(),
            pgid: pid.map(|p| p as i32),
            child,
        })
    }
}

fn forward_output<R>(world: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(world = %world, stream, "{}", line);
        }
    });
}

/// A server spawned by `ShellLauncher`.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    pgid: Option<i32>,
}

impl ServerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn send_line(&mut self, line: &str) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "console closed"))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    fn try_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    async fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn kill(&mut self) -> io::Result<ExitStatus> {
        if let Some(pgid) = self.pgid {
            // SAFETY: plain syscall; a group that is already gone yields ESRCH.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
        // The group may be gone while the direct child still needs reaping.
        let _ = self.child.start_kill();
        self.stdin = None;
        self.child.wait().await
    }
}

/// How often `wait_for_exit` checks on a process it does not own.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// True if a process with this pid exists.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks for existence and permission.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Send `signal` to the process group led by `pid`, or to `pid` alone when
/// it leads no group. A process that is already gone is not an error.
pub fn signal_group(pid: u32, signal: i32) -> io::Result<()> {
    let pid = i32::try_from(pid)
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"))?;
    for target in [-pid, pid] {
        // SAFETY: plain syscall, no memory is shared with the target.
        if unsafe { libc::kill(target, signal) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

/// Poll until `pid` is gone. Returns false if it outlived `timeout`.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let started = Instant::now();
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if started.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}
