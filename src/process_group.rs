//! Hard kills for whole process groups.
//!
//! Shells fork. Killing only the shell pid leaves background jobs and
//! pipeline members alive, still holding the PTY or the output pipes.
//! Both executors start their shell as a group leader (portable-pty makes
//! it a session leader; the one-shot executor sets `process_group(0)`), so
//! the group id equals the shell pid.

use std::io;

/// Sends `SIGKILL` to every process in group `pgid`. A group that no
/// longer exists is not an error.
#[cfg(unix)]
pub fn kill_process_group(pgid: u32) -> io::Result<()> {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "pgid out of range"));
    };
    if pgid <= 0 {
        // killpg(0) would target our own group
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid pgid"));
    }
    let result = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if result == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn kill_process_group(_pgid: u32) -> io::Result<()> {
    Ok(())
}
