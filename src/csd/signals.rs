use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::time::{self, Duration};

/// Requests raised by signal delivery and consumed by the supervision loop.
///
/// Written only from the signal side, read only at the loop's polling point.
#[derive(Debug, Default)]
pub struct ControlFlags {
    terminate: AtomicBool,
    stats: AtomicBool,
}

impl ControlFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub fn terminate_requested(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    pub fn request_stats(&self) {
        self.stats.store(true, Ordering::SeqCst);
    }

    /// Consume a pending stats-dump request.
    pub fn take_stats_request(&self) -> bool {
        self.stats.swap(false, Ordering::SeqCst)
    }
}

/// Where the supervision loop blocks between passes.
pub trait WakeSource {
    /// Return after `timeout` (forever when `None`) or as soon as an external event arrives.
    fn wait(&mut self, timeout: Option<Duration>) -> impl Future<Output = ()>;

    fn flags(&self) -> &ControlFlags;
}

/// Collect every exited child without blocking. Returns how many were reaped.
pub fn reap_children() -> usize {
    let mut reaped = 0usize;
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                reaped += 1;
                tracing::debug!(?status, "reaped child");
            }
            // ECHILD: no children left.
            Err(_) => break,
        }
    }
    reaped
}

/// SIGTERM, SIGCHLD and SIGUSR1 routed into loop-visible state.
///
/// tokio's handler only records delivery; the reaping and flag updates below run on the
/// loop's own thread when `wait` observes the signal.
#[derive(Debug)]
pub struct SignalBridge {
    flags: ControlFlags,
    term: Signal,
    child: Signal,
    stats: Signal,
}

impl SignalBridge {
    /// Register the handlers. Must be called inside the tokio runtime, before any worker
    /// is launched so no early exit or termination request is missed.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            flags: ControlFlags::new(),
            term: signal(SignalKind::terminate())?,
            child: signal(SignalKind::child())?,
            stats: signal(SignalKind::user_defined1())?,
        })
    }
}

impl WakeSource for SignalBridge {
    async fn wait(&mut self, timeout: Option<Duration>) {
        let timer = async {
            match timeout {
                Some(d) => time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = timer => {}
            _ = self.term.recv() => {
                tracing::info!("termination requested");
                self.flags.request_terminate();
            }
            _ = self.child.recv() => {
                let n = reap_children();
                tracing::debug!(reaped = n, "child state changed");
            }
            _ = self.stats.recv() => {
                self.flags.request_stats();
            }
        }
    }

    fn flags(&self) -> &ControlFlags {
        &self.flags
    }
}
