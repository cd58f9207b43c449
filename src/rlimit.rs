//! Resource-limit bookkeeping ahead of loading thousands of programs.
//!
//! Mass-attaching touches two resource ceilings the kernel enforces on an
//! unprivileged-looking process: the locked-memory limit (every loaded BPF
//! program and map counts against it pre-5.11 kernels, and some
//! distributions still enforce it) and the open-file-descriptor limit
//! (two fds per selected function, plus the program and link fds in
//! flight during Load/Attach, adds up fast). Both are raised once, before
//! `Load`; failure here is fatal rather than attempted per-syscall, since a
//! partial raise would fail unpredictably partway through cloning.

use crate::error::Error;
use crate::error::Result;

/// Default open-file ceiling if the caller leaves `max_fileno_rlimit` at
/// `0`. Generous relative to "a few thousand functions", since each
/// selected function holds two program fds and, after Attach, up to two
/// link fds concurrently.
pub const DEFAULT_FILENO_RLIMIT: u64 = 300_000;

/// Raise `RLIMIT_MEMLOCK` to the host maximum (or unlimited, if the kernel
/// allows it) and `RLIMIT_NOFILE` to `max_fileno_rlimit` (or
/// [`DEFAULT_FILENO_RLIMIT`] if `0`).
pub fn raise_limits(max_fileno_rlimit: u64) -> Result<()> {
    raise_memlock()?;
    raise_nofile(if max_fileno_rlimit == 0 {
        DEFAULT_FILENO_RLIMIT
    } else {
        max_fileno_rlimit
    })
}

fn raise_memlock() -> Result<()> {
    let limit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &limit) };
    if ret != 0 {
        return Err(Error::Resource(format!(
            "failed to raise RLIMIT_MEMLOCK: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn raise_nofile(target: u64) -> Result<()> {
    let mut current = unsafe { std::mem::zeroed::<libc::rlimit>() };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut current) } != 0 {
        return Err(Error::Resource(format!(
            "failed to read RLIMIT_NOFILE: {}",
            std::io::Error::last_os_error()
        )));
    }

    if current.rlim_cur >= target as libc::rlim_t {
        return Ok(());
    }

    let limit = libc::rlimit {
        rlim_cur: target as libc::rlim_t,
        rlim_max: std::cmp::max(current.rlim_max, target as libc::rlim_t),
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) };
    if ret != 0 {
        return Err(Error::Resource(format!(
            "failed to raise RLIMIT_NOFILE to {target}: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raising_below_current_nofile_is_a_noop() {
        // A ceiling of 1 is certainly already satisfied by any running
        // test process, so this should succeed without touching the
        // process' actual limits.
        assert!(raise_nofile(1).is_ok());
    }
}
