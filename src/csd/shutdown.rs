use crate::csd::launcher::ProcessControl;
use crate::csd::registry::Registry;
use nix::sys::signal::Signal;
use tokio::time::{self, Duration};

/// Pause between sweeps so workers can finish writing their recordings.
pub const GRACE: Duration = Duration::from_secs(5);
/// One polite sweep plus ten forceful ones.
pub const MAX_SWEEPS: u32 = 11;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub sweeps: u32,
    pub signals_sent: u32,
    /// Workers still observed running when the sweep limit was reached.
    pub survivors: u32,
}

/// Stop every live, non-disabled worker: SIGTERM first, SIGKILL on later sweeps.
///
/// Returns as soon as a sweep finds nothing left to signal, or after `MAX_SWEEPS`.
pub async fn shutdown<P: ProcessControl>(registry: &Registry, processes: &P, grace: Duration) -> ShutdownReport {
    let mut report = ShutdownReport::default();

    for sweep in 0..MAX_SWEEPS {
        let sig = if sweep == 0 { Signal::SIGTERM } else { Signal::SIGKILL };
        let mut live = 0u32;

        for worker in registry.iter().filter(|w| !w.is_disabled()) {
            let Some(pid) = worker.pid() else { continue };
            if !processes.is_running(pid) {
                continue;
            }
            live += 1;
            tracing::info!(worker = %worker.name(), pid = pid.as_raw(), signal = %sig, "stopping worker");
            match processes.signal(pid, sig) {
                Ok(()) => report.signals_sent += 1,
                Err(e) => {
                    tracing::warn!(worker = %worker.name(), pid = pid.as_raw(), signal = %sig, error = %e, "unable to signal worker");
                }
            }
        }

        report.sweeps = sweep + 1;
        if live == 0 {
            return report;
        }
        if sweep + 1 == MAX_SWEEPS {
            report.survivors = live;
            break;
        }
        time::sleep(grace).await;
    }

    tracing::warn!(survivors = report.survivors, "giving up on workers that would not stop");
    report
}
