use anyhow::Context as _;
use nix::fcntl::{OFlag, open};
use nix::sys::resource::{Resource, getrlimit};
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::sys::stat::{Mode, umask};
use nix::unistd::{ForkResult, chdir, close, dup2, fork, setsid};
use std::os::unix::io::RawFd;

/// Used when RLIMIT_NOFILE reports no limit.
const FALLBACK_MAX_FDS: u64 = 1024;

/// Detach from the invoking terminal and session.
///
/// Must run before any tokio runtime or extra thread exists. On return the caller is the
/// grandchild; both intermediate parents have exited with status 0. Standard input is
/// `/dev/null`, as are stdout/stderr until the log relay takes them over.
pub fn daemonize() -> anyhow::Result<()> {
    umask(Mode::empty());

    let max_fds = max_open_files().context("query RLIMIT_NOFILE")?;

    fork_and_exit_parent().context("first fork")?;
    setsid().context("setsid")?;
    // SAFETY: installing SIG_IGN runs no user code in signal context.
    unsafe { signal(Signal::SIGHUP, SigHandler::SigIgn) }.context("ignore SIGHUP")?;
    fork_and_exit_parent().context("second fork")?;

    chdir("/").context("chdir /")?;

    close_descriptors(max_fds);
    redirect_stdio_to_null().context("redirect stdio to /dev/null")?;
    Ok(())
}

fn max_open_files() -> nix::Result<u64> {
    let (soft, _hard) = getrlimit(Resource::RLIMIT_NOFILE)?;
    if soft == libc::RLIM_INFINITY {
        Ok(FALLBACK_MAX_FDS)
    } else {
        Ok(soft)
    }
}

fn fork_and_exit_parent() -> nix::Result<()> {
    // SAFETY: called while the process is still single-threaded.
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => Ok(()),
    }
}

/// Best-effort: most of these were never open.
fn close_descriptors(max_fds: u64) {
    let upper = RawFd::try_from(max_fds).unwrap_or(RawFd::MAX);
    for fd in 0..upper {
        let _ = close(fd);
    }
}

fn redirect_stdio_to_null() -> nix::Result<()> {
    let fd = open("/dev/null", OFlag::O_RDWR, Mode::empty())?;
    for target in 0..=2 {
        if fd != target {
            dup2(fd, target)?;
        }
    }
    if fd > 2 {
        close(fd)?;
    }
    Ok(())
}
