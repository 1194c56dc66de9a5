use anyhow::Context as _;
use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;
use nix::unistd::{close, dup2};
use std::os::unix::io::AsRawFd;
use std::io;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

pub const LOGGER_PROGRAM: &str = "/usr/bin/logger";
pub const LOGGER_ARGS: [&str; 4] = ["-t", "camsrvd", "-p", "user.notice"];
/// Upper bound on waiting for the logger at exit. A worker that outlived shutdown still holds
/// the pipe's write end, so the logger may never see EOF.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Forwards everything the supervisor writes to stdout/stderr into syslog.
///
/// Workers inherit the same descriptors, so their output lands in syslog too.
#[derive(Debug)]
pub struct LogRelay {
    child: Child,
}

impl LogRelay {
    /// Spawn the system logger and point fds 1 and 2 at its stdin.
    pub fn start() -> anyhow::Result<Self> {
        Self::start_with(LOGGER_PROGRAM, &LOGGER_ARGS)
    }

    pub fn start_with(program: &str, args: &[&str]) -> anyhow::Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn log relay program={program}"))?;

        let Some(stdin) = child.stdin.take() else {
            anyhow::bail!("log relay {program} has no stdin pipe");
        };
        let fd = stdin.as_raw_fd();
        dup2(fd, libc::STDOUT_FILENO).context("redirect stdout to log relay")?;
        dup2(fd, libc::STDERR_FILENO).context("redirect stderr to log relay")?;
        // fds 1 and 2 now hold the write end; the pipe descriptor itself can go.
        drop(stdin);

        Ok(Self { child })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Close our write end and wait for the logger to drain and exit.
    pub fn finish(mut self) -> anyhow::Result<()> {
        let null = open("/dev/null", OFlag::O_WRONLY, Mode::empty()).context("open /dev/null")?;
        let rebind = dup2(null, libc::STDOUT_FILENO)
            .and_then(|_| dup2(null, libc::STDERR_FILENO))
            .context("detach stdout/stderr from log relay");
        if null > libc::STDERR_FILENO {
            let _ = close(null);
        }
        rebind?;

        if !wait_bounded(&mut self.child, DRAIN_TIMEOUT).context("wait for log relay")? {
            anyhow::bail!(
                "log relay pid={} still running after {:?}; leaving it behind",
                self.child.id(),
                DRAIN_TIMEOUT
            );
        }
        Ok(())
    }
}

/// Poll `child` until it exits or `timeout` passes. Returns whether it exited.
fn wait_bounded(child: &mut Child, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return Ok(true),
            Ok(None) => {}
            // Already collected by the SIGCHLD reaper.
            Err(e) if e.raw_os_error() == Some(libc::ECHILD) => return Ok(true),
            Err(e) => return Err(e),
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        std::thread::sleep(DRAIN_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_wait_sees_exit() {
        let mut child = Command::new("/bin/true").spawn().unwrap();
        assert!(wait_bounded(&mut child, Duration::from_secs(10)).unwrap());
    }

    #[test]
    fn bounded_wait_gives_up_on_a_logger_that_never_finishes() {
        let mut child = Command::new("/bin/sleep").arg("30").spawn().unwrap();
        let started = Instant::now();
        assert!(!wait_bounded(&mut child, Duration::from_millis(200)).unwrap());
        assert!(started.elapsed() < Duration::from_secs(10));
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn reaped_logger_counts_as_finished() {
        let mut child = Command::new("/bin/true").spawn().unwrap();
        let pid = nix::unistd::Pid::from_raw(child.id() as i32);
        nix::sys::wait::waitpid(pid, None).unwrap();
        assert!(wait_bounded(&mut child, Duration::from_secs(1)).unwrap());
    }
}
