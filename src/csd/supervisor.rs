use crate::csd::launcher::ProcessControl;
use crate::csd::notify::Notifier;
use crate::csd::registry::{Registry, Worker, WorkerState};
use crate::csd::signals::WakeSource;
use tokio::time::{Duration, Instant};

/// Restart tolerance shared by every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Detections of an unexpected exit before the worker is disabled for good.
    pub max_failures: u32,
    /// Backoff before a relaunch, and healthy runtime required to forgive past failures.
    pub reset_timer: Duration,
}

/// Outcome of one pass over the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pass {
    /// How long the loop may block before the next timer could matter. `None` suspends
    /// until a signal arrives.
    pub sleep: Option<Duration>,
    pub all_disabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// A termination request was observed after a wait.
    Terminated,
    /// Every worker reached DISABLED; nothing is left to supervise.
    AllDisabled,
}

impl LoopExit {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopExit::Terminated => "terminated",
            LoopExit::AllDisabled => "all_disabled",
        }
    }
}

/// Owns the worker registry and drives its state machine.
pub struct Supervisor<P, N> {
    registry: Registry,
    policy: RestartPolicy,
    processes: P,
    notifier: N,
}

impl<P: ProcessControl, N: Notifier> Supervisor<P, N> {
    pub fn new(registry: Registry, policy: RestartPolicy, processes: P, notifier: N) -> Self {
        Self {
            registry,
            policy,
            processes,
            notifier,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn policy(&self) -> RestartPolicy {
        self.policy
    }

    pub fn processes(&self) -> &P {
        &self.processes
    }

    pub fn into_registry(self) -> Registry {
        self.registry
    }

    /// Initial launch of the whole roster, in order.
    pub fn launch_all(&mut self, now: Instant) {
        tracing::info!(workers = self.registry.len(), "starting commands");
        for worker in self.registry.iter_mut() {
            tracing::info!(worker = %worker.name(), "starting worker");
            worker.last_start = Some(now);
            worker.pid = start(&self.processes, worker);
        }
    }

    /// Advance every non-disabled worker by at most one transition and compute the next wait.
    pub fn pass(&mut self, now: Instant) -> Pass {
        let policy = self.policy;
        let mut sleep: Option<Duration> = None;
        let mut rescan = false;

        for worker in self.registry.iter_mut() {
            if worker.disabled {
                continue;
            }

            match worker.state() {
                WorkerState::Backoff => {
                    let due = worker
                        .last_reset
                        .is_none_or(|at| now.saturating_duration_since(at) >= policy.reset_timer);
                    if due {
                        tracing::info!(worker = %worker.name(), error_count = worker.error_count, "attempting to recover worker");
                        worker.last_start = Some(now);
                        worker.resetting = false;
                        worker.last_reset = None;
                        worker.pid = start(&self.processes, worker);
                        rescan |= worker.pid.is_none();
                    }
                }
                WorkerState::Healthy | WorkerState::Degraded => {
                    let alive = worker.pid.is_some_and(|pid| self.processes.is_running(pid));
                    if !alive {
                        worker.error_count += 1;
                        tracing::warn!(
                            worker = %worker.name(),
                            pid = worker.pid.map(|p| p.as_raw()),
                            error_count = worker.error_count,
                            "worker is no longer running"
                        );
                        worker.pid = None;
                        if worker.error_count >= policy.max_failures {
                            worker.disabled = true;
                            tracing::error!(
                                worker = %worker.name(),
                                error_count = worker.error_count,
                                "worker failed too many times and has been disabled"
                            );
                            notify_disabled(&self.notifier, worker);
                            continue;
                        }
                        worker.resetting = true;
                        worker.last_reset = Some(now);
                    } else if worker.error_count > 0
                        && worker
                            .last_start
                            .is_some_and(|at| now.saturating_duration_since(at) >= policy.reset_timer)
                    {
                        tracing::info!(worker = %worker.name(), "worker appears healthy again, resetting error count");
                        worker.error_count = 0;
                    }
                }
                WorkerState::Disabled => continue,
            }

            if let Some(remaining) = worker.remaining(now, policy.reset_timer) {
                sleep = Some(sleep.map_or(remaining, |s| s.min(remaining)));
            }
        }

        if rescan {
            sleep = Some(Duration::ZERO);
        }

        Pass {
            sleep,
            all_disabled: self.registry.all_disabled(),
        }
    }

    /// Run passes until a termination request or until every worker is disabled.
    pub async fn run<W: WakeSource>(&mut self, wake: &mut W) -> LoopExit {
        tracing::info!("starting command monitoring");
        loop {
            let pass = self.pass(Instant::now());
            if pass.all_disabled {
                tracing::warn!("all workers have become disabled, nothing left to do");
                return LoopExit::AllDisabled;
            }

            match pass.sleep {
                Some(d) => tracing::debug!(sleep_ms = d.as_millis() as u64, "sleeping"),
                None => tracing::debug!("suspending until something happens"),
            }
            wake.wait(pass.sleep).await;

            if wake.flags().terminate_requested() {
                return LoopExit::Terminated;
            }
            if wake.flags().take_stats_request() {
                for line in self.registry.report(Instant::now()) {
                    tracing::info!(target: "camsrvd::stats", "{line}");
                }
            }
        }
    }
}

fn start<P: ProcessControl>(processes: &P, worker: &Worker) -> Option<nix::unistd::Pid> {
    match processes.launch(worker.command()) {
        Ok(pid) => {
            tracing::info!(worker = %worker.name(), pid = pid.as_raw(), "worker started");
            Some(pid)
        }
        Err(e) => {
            tracing::error!(worker = %worker.name(), error = %e, "failed to start worker");
            None
        }
    }
}

fn notify_disabled<N: Notifier>(notifier: &N, worker: &Worker) {
    match notifier.worker_disabled(worker.name(), worker.command()) {
        Ok(status) if status.success() => {
            tracing::info!(worker = %worker.name(), "sent disabled notification");
        }
        Ok(status) => {
            tracing::error!(worker = %worker.name(), %status, "unable to send notification");
        }
        Err(e) => {
            tracing::error!(worker = %worker.name(), error = %e, "unable to send notification");
        }
    }
}
