use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::io;
use std::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("refusing to run an empty command line")]
    NoCommand,
    #[error("unable to parse command line {command:?} (unbalanced quoting or trailing escape)")]
    Parse { command: String },
    #[error("spawn program={program} failed: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Split a resolved command line into argv using POSIX shell quoting rules.
pub fn tokenize(command: &str) -> Result<Vec<String>, LaunchError> {
    if command.trim().is_empty() {
        return Err(LaunchError::NoCommand);
    }
    let argv = shlex::split(command).ok_or_else(|| LaunchError::Parse {
        command: command.to_string(),
    })?;
    if argv.is_empty() {
        return Err(LaunchError::NoCommand);
    }
    Ok(argv)
}

/// Start `command` in the background and return its pid.
///
/// The child inherits stdin/stdout/stderr from the supervisor, so its output follows
/// wherever the log relay has pointed them. An exec failure in the child is reported
/// back through `Command::spawn` and never runs supervisor code in the child.
pub fn launch(command: &str) -> Result<Pid, LaunchError> {
    let argv = tokenize(command)?;
    let program = argv[0].clone();
    let child = Command::new(&program)
        .args(&argv[1..])
        .spawn()
        .map_err(|source| LaunchError::Spawn {
            program: program.clone(),
            source,
        })?;
    let pid = Pid::from_raw(child.id() as i32);
    // Dropping `Child` neither kills nor waits; the pid is tracked by the registry and
    // collected by `is_running` or the SIGCHLD reaper.
    drop(child);
    Ok(pid)
}

/// Non-blocking liveness probe for a child we spawned.
pub fn is_running(pid: Pid) -> bool {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => true,
        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => false,
        // Stopped/continued and ptrace states: the process still exists.
        Ok(_) => true,
        // Already collected by the SIGCHLD reaper.
        Err(Errno::ECHILD) => false,
        Err(_) => match kill(pid, None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        },
    }
}

/// Process operations the supervision loop and shutdown coordinator depend on.
pub trait ProcessControl {
    fn launch(&self, command: &str) -> Result<Pid, LaunchError>;
    fn is_running(&self, pid: Pid) -> bool;
    fn signal(&self, pid: Pid, signal: Signal) -> nix::Result<()>;
}

/// The real OS-backed implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcesses;

impl ProcessControl for OsProcesses {
    fn launch(&self, command: &str) -> Result<Pid, LaunchError> {
        launch(command)
    }

    fn is_running(&self, pid: Pid) -> bool {
        is_running(pid)
    }

    fn signal(&self, pid: Pid, signal: Signal) -> nix::Result<()> {
        kill(pid, signal)
    }
}

impl<T: ProcessControl + ?Sized> ProcessControl for &T {
    fn launch(&self, command: &str) -> Result<Pid, LaunchError> {
        (**self).launch(command)
    }

    fn is_running(&self, pid: Pid) -> bool {
        (**self).is_running(pid)
    }

    fn signal(&self, pid: Pid, signal: Signal) -> nix::Result<()> {
        (**self).signal(pid, signal)
    }
}
