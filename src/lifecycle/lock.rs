//! Cross-process instance lock.
//!
//! # Responsibilities
//! - Serialize every mutation of shared world/port state across manager
//!   processes on the same host
//! - Bound the wait according to `[emsm] timeout`
//!
//! # Design Decisions
//! - `flock(2)` on a lock file: released by the kernel if the holder dies
//! - Each acquisition opens the file anew, so two acquisitions inside one
//!   process exclude each other as well
//! - Polling keeps the wait cancellable; dropping the future drops the file
//! - `LockGuard` releases on drop, covering error and cancellation paths

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::config::LockTimeout;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("gave up waiting for the instance lock {path} after {waited:?}")]
    Timeout { path: PathBuf, waited: Duration },

    #[error("instance lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Handle on the lock file; cheap to clone, holds nothing by itself.
#[derive(Debug, Clone)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, waiting at most `timeout`.
    pub async fn acquire(&self, timeout: LockTimeout) -> Result<LockGuard, LockError> {
        let started = Instant::now();
        let deadline = timeout.as_duration().map(|limit| started + limit);
        let file = self.open()?;

        loop {
            if try_flock(&file).map_err(|source| self.io_error(source))? {
                record_holder(&file);
                tracing::debug!(path = %self.path.display(), waited = ?started.elapsed(), "Instance lock acquired");
                return Ok(LockGuard {
                    file: Some(file),
                    path: self.path.clone(),
                });
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::warn!(path = %self.path.display(), "Instance lock timeout");
                        return Err(LockError::Timeout {
                            path: self.path.clone(),
                            waited: started.elapsed(),
                        });
                    }
                    POLL_INTERVAL.min(deadline - now)
                }
                None => POLL_INTERVAL,
            };
            tokio::time::sleep(pause).await;
        }
    }

    fn open(&self) -> Result<File, LockError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|source| self.io_error(source))
    }

    fn io_error(&self, source: io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Proof that the instance lock is held.
///
/// Functions that mutate shared state take a `&LockGuard`.
#[derive(Debug)]
pub struct LockGuard {
    file: Option<File>,
    path: PathBuf,
}

impl LockGuard {
    /// Release the lock. Calling it again is a no-op.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            // SAFETY: the descriptor is owned by `file` and still open.
            unsafe {
                libc::flock(file.as_raw_fd(), libc::LOCK_UN);
            }
            tracing::debug!(path = %self.path.display(), "Instance lock released");
        }
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Non-blocking exclusive `flock`; `Ok(false)` when another holder has it.
fn try_flock(file: &File) -> io::Result<bool> {
    // SAFETY: plain syscall on a descriptor owned by `file`.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK || code == libc::EINTR => Ok(false),
        _ => Err(err),
    }
}

/// Write our pid into the lock file for whoever wonders who holds it.
fn record_holder(file: &File) {
    let mut writer = file;
    let result = file
        .set_len(0)
        .and_then(|_| writeln!(writer, "{}", std::process::id()));
    if let Err(e) = result {
        tracing::debug!(error = %e, "Could not record lock holder pid");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(dir: &tempfile::TempDir) -> InstanceLock {
        InstanceLock::new(dir.path().join("emsm.lock"))
    }

    #[tokio::test]
    async fn test_acquire_release_reacquire() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock(&dir);

        let mut guard = lock.acquire(LockTimeout::Seconds(0)).await.unwrap();
        assert!(guard.is_held());
        let pid = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());

        guard.release();
        guard.release();
        assert!(!guard.is_held());

        let again = lock.acquire(LockTimeout::Seconds(0)).await.unwrap();
        assert!(again.is_held());
    }

    #[tokio::test]
    async fn test_try_lock_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock(&dir);

        let _held = lock.acquire(LockTimeout::Forever).await.unwrap();
        let err = lock.acquire(LockTimeout::Seconds(0)).await.unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_bounded_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock(&dir);

        let _held = lock.acquire(LockTimeout::Forever).await.unwrap();
        let started = std::time::Instant::now();
        let err = lock.acquire(LockTimeout::Seconds(1)).await.unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock(&dir);

        {
            let _guard = lock.acquire(LockTimeout::Forever).await.unwrap();
        }
        assert!(lock.acquire(LockTimeout::Seconds(0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock(&dir);

        let guard = lock.acquire(LockTimeout::Forever).await.unwrap();
        let holder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(guard);
        });

        let waiter = lock.acquire(LockTimeout::Forever).await.unwrap();
        assert!(waiter.is_held());
        holder.await.unwrap();
    }
}
