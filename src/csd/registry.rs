use chrono::Local;
use nix::unistd::Pid;
use std::fmt;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Healthy,
    Degraded,
    Backoff,
    Disabled,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Healthy => "HEALTHY",
            WorkerState::Degraded => "DEGRADED",
            WorkerState::Backoff => "BACKOFF",
            WorkerState::Disabled => "DISABLED",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One supervised capture command.
///
/// Identity (`name`, `command`) is fixed at construction. Everything else is mutated only
/// by the supervision loop.
#[derive(Debug, Clone)]
pub struct Worker {
    name: String,
    command: String,
    pub(crate) pid: Option<Pid>,
    pub(crate) error_count: u32,
    pub(crate) disabled: bool,
    pub(crate) resetting: bool,
    pub(crate) last_start: Option<Instant>,
    pub(crate) last_reset: Option<Instant>,
}

impl Worker {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            pid: None,
            error_count: 0,
            disabled: false,
            resetting: false,
            last_start: None,
            last_reset: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn is_resetting(&self) -> bool {
        self.resetting
    }

    pub fn last_start(&self) -> Option<Instant> {
        self.last_start
    }

    pub fn last_reset(&self) -> Option<Instant> {
        self.last_reset
    }

    pub fn state(&self) -> WorkerState {
        if self.disabled {
            WorkerState::Disabled
        } else if self.resetting {
            WorkerState::Backoff
        } else if self.error_count > 0 {
            WorkerState::Degraded
        } else {
            WorkerState::Healthy
        }
    }

    /// Time left on whichever timer currently matters for this worker, if any.
    ///
    /// BACKOFF counts from `last_reset`, DEGRADED from `last_start`. HEALTHY and DISABLED
    /// workers have no pending timer.
    pub fn remaining(&self, now: Instant, reset_timer: Duration) -> Option<Duration> {
        let since = match self.state() {
            WorkerState::Backoff => self.last_reset?,
            WorkerState::Degraded => self.last_start?,
            WorkerState::Healthy | WorkerState::Disabled => return None,
        };
        Some(reset_timer.saturating_sub(now.saturating_duration_since(since)))
    }

    /// One human-readable status line, used by the SIGUSR1 stats dump.
    pub fn status_line(&self, now: Instant) -> String {
        let pid = self
            .pid
            .map(|p| p.as_raw().to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "worker={} state={} pid={} error_count={} disabled={} resetting={} last_reset={} last_start={} command={:?}",
            self.name,
            self.state(),
            pid,
            self.error_count,
            yes_no(self.disabled),
            yes_no(self.resetting),
            wall_clock(self.last_reset, now),
            wall_clock(self.last_start, now),
            self.command,
        )
    }
}

fn yes_no(b: bool) -> &'static str {
    if b { "yes" } else { "no" }
}

/// Map a monotonic instant onto local wall-clock time for display.
fn wall_clock(at: Option<Instant>, now: Instant) -> String {
    let Some(at) = at else {
        return "-".to_string();
    };
    let ago = chrono::Duration::from_std(now.saturating_duration_since(at))
        .unwrap_or_else(|_| chrono::Duration::zero());
    (Local::now() - ago).format("%Y-%m-%d_%H:%M:%S").to_string()
}

/// Roster-ordered set of workers.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    workers: Vec<Worker>,
}

impl Registry {
    pub fn new(workers: Vec<Worker>) -> Self {
        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Worker> {
        self.workers.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Worker> {
        self.workers.iter_mut()
    }

    pub fn get(&self, name: &str) -> Option<&Worker> {
        self.workers.iter().find(|w| w.name == name)
    }

    pub fn all_disabled(&self) -> bool {
        self.workers.iter().all(|w| w.disabled)
    }

    pub fn report(&self, now: Instant) -> Vec<String> {
        self.workers.iter().map(|w| w.status_line(now)).collect()
    }
}

impl FromIterator<Worker> for Registry {
    fn from_iter<I: IntoIterator<Item = Worker>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> Worker {
        Worker::new("front", "/bin/true")
    }

    #[test]
    fn state_follows_flags() {
        let mut w = worker();
        assert_eq!(w.state(), WorkerState::Healthy);
        w.error_count = 1;
        assert_eq!(w.state(), WorkerState::Degraded);
        w.resetting = true;
        assert_eq!(w.state(), WorkerState::Backoff);
        w.disabled = true;
        assert_eq!(w.state(), WorkerState::Disabled);
    }

    #[test]
    fn remaining_uses_the_timer_for_the_current_state() {
        let t0 = Instant::now();
        let timer = Duration::from_secs(10);
        let mut w = worker();
        w.last_start = Some(t0);
        assert_eq!(w.remaining(t0 + Duration::from_secs(3), timer), None);

        w.error_count = 1;
        assert_eq!(
            w.remaining(t0 + Duration::from_secs(3), timer),
            Some(Duration::from_secs(7))
        );

        w.resetting = true;
        w.last_reset = Some(t0 + Duration::from_secs(5));
        assert_eq!(
            w.remaining(t0 + Duration::from_secs(6), timer),
            Some(Duration::from_secs(9))
        );
        // Overdue timers saturate to zero rather than wrapping.
        assert_eq!(
            w.remaining(t0 + Duration::from_secs(60), timer),
            Some(Duration::ZERO)
        );

        w.disabled = true;
        assert_eq!(w.remaining(t0 + Duration::from_secs(6), timer), None);
    }

    #[test]
    fn registry_keeps_roster_order() {
        let reg: Registry = ["c", "a", "b"]
            .into_iter()
            .map(|n| Worker::new(n, "/bin/true"))
            .collect();
        let names: Vec<&str> = reg.iter().map(Worker::name).collect();
        assert_eq!(names, ["c", "a", "b"]);
        assert!(reg.get("a").is_some());
        assert!(reg.get("z").is_none());
    }

    #[test]
    fn all_disabled_requires_every_worker() {
        let mut reg: Registry = ["a", "b"]
            .into_iter()
            .map(|n| Worker::new(n, "/bin/true"))
            .collect();
        assert!(!reg.all_disabled());
        reg.iter_mut().next().unwrap().disabled = true;
        assert!(!reg.all_disabled());
        reg.iter_mut().for_each(|w| w.disabled = true);
        assert!(reg.all_disabled());
    }

    #[test]
    fn status_line_marks_missing_values() {
        let now = Instant::now();
        let line = worker().status_line(now);
        assert!(line.starts_with("worker=front state=HEALTHY pid=- error_count=0"));
        assert!(line.contains("last_reset=- last_start=-"));
        assert!(line.ends_with("command=\"/bin/true\""));
    }
}
