//! Startup checks.
//!
//! # Responsibilities
//! - Make sure the manager runs as the `[emsm] user` before any file is
//!   created, so worlds, locks and configuration keep a single owner
//!
//! # Design Decisions
//! - Running as root drops privileges to the configured user
//! - Running as anyone else only produces a warning; the caller decides

use std::ffi::CString;
use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configured user '{0}' does not exist")]
    UnknownUser(String),

    #[error("failed to switch to user '{user}': {source}")]
    Switch {
        user: String,
        #[source]
        source: io::Error,
    },

    #[error("user lookup failed: {0}")]
    Lookup(#[from] io::Error),
}

/// Result of comparing the process user with the configured one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCheck {
    Matches,
    Switched { uid: u32, gid: u32 },
    Mismatch { current_uid: u32 },
}

/// Run as `user`, dropping root privileges when possible.
pub fn ensure_user(user: &str) -> Result<UserCheck, StartupError> {
    let (uid, gid) = lookup_user(user)?.ok_or_else(|| StartupError::UnknownUser(user.to_string()))?;
    // SAFETY: geteuid has no preconditions.
    let current = unsafe { libc::geteuid() };

    if current == uid {
        return Ok(UserCheck::Matches);
    }
    if current != 0 {
        return Ok(UserCheck::Mismatch { current_uid: current });
    }

    let switch_err = |source| StartupError::Switch {
        user: user.to_string(),
        source,
    };
    // SAFETY: plain syscalls; group first, since setuid drops the right to change it.
    unsafe {
        if libc::setgroups(1, &gid) != 0 || libc::setgid(gid) != 0 {
            return Err(switch_err(io::Error::last_os_error()));
        }
        if libc::setuid(uid) != 0 {
            return Err(switch_err(io::Error::last_os_error()));
        }
    }
    tracing::info!(user = %user, uid, gid, "Dropped root privileges");
    Ok(UserCheck::Switched { uid, gid })
}

/// uid and primary gid of a user, `None` if it does not exist.
pub fn lookup_user(user: &str) -> io::Result<Option<(u32, u32)>> {
    let name = CString::new(user)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "user name contains NUL"))?;
    // SAFETY: `passwd` is plain old data, zeroed is a valid value.
    let mut entry: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0 as libc::c_char; 16 * 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    // SAFETY: every pointer is valid for the duration of the call and `buf`
    // outlives every use of `entry`.
    let rc = unsafe {
        libc::getpwnam_r(
            name.as_ptr(),
            &mut entry,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    if result.is_null() {
        return Ok(None);
    }
    Ok(Some((entry.pw_uid, entry.pw_gid)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_root() {
        assert_eq!(lookup_user("root").unwrap(), Some((0, 0)));
    }

    #[test]
    fn test_unknown_user() {
        assert_eq!(lookup_user("emsm-no-such-user").unwrap(), None);
        assert!(matches!(
            ensure_user("emsm-no-such-user"),
            Err(StartupError::UnknownUser(_))
        ));
    }
}
