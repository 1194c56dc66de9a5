use camsrvd::csd::launcher::{self, OsProcesses, ProcessControl};
use camsrvd::csd::notify::Notifier;
use camsrvd::csd::registry::{Registry, Worker, WorkerState};
use camsrvd::csd::shutdown::shutdown;
use camsrvd::csd::supervisor::{RestartPolicy, Supervisor};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::cell::RefCell;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

#[derive(Default)]
struct CountingNotifier {
    disabled: RefCell<Vec<String>>,
}

impl Notifier for CountingNotifier {
    fn worker_disabled(&self, name: &str, _command: &str) -> anyhow::Result<ExitStatus> {
        self.disabled.borrow_mut().push(name.to_string());
        Ok(ExitStatus::from_raw(0))
    }
}

fn wait_until_gone(pid: Pid) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if !launcher::is_running(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn probe_tracks_a_real_child() {
    let pid = launcher::launch("/bin/sleep 30").unwrap();
    assert!(launcher::is_running(pid));

    OsProcesses.signal(pid, Signal::SIGTERM).unwrap();
    assert!(wait_until_gone(pid));
    // Already reaped: still reported as gone.
    assert!(!launcher::is_running(pid));
}

#[test]
fn short_lived_child_is_detected_as_dead() {
    let pid = launcher::launch("/bin/sh -c 'exit 7'").unwrap();
    assert!(wait_until_gone(pid));
}

#[test]
fn crashing_worker_is_disabled_after_single_allowed_failure() {
    let notifier = CountingNotifier::default();
    let registry: Registry = [Worker::new("crashy", "/bin/sh -c 'exit 1'")].into_iter().collect();
    let policy = RestartPolicy {
        max_failures: 1,
        reset_timer: Duration::from_secs(60),
    };
    let mut sv = Supervisor::new(registry, policy, OsProcesses, &notifier);
    sv.launch_all(tokio::time::Instant::now());
    let pid = sv.registry().get("crashy").unwrap().pid().unwrap();
    assert!(wait_until_gone(pid));

    let pass = sv.pass(tokio::time::Instant::now());
    assert!(pass.all_disabled);
    assert_eq!(sv.registry().get("crashy").unwrap().state(), WorkerState::Disabled);
    assert_eq!(notifier.disabled.borrow().as_slice(), ["crashy".to_string()]);
}

#[tokio::test]
async fn shutdown_stops_real_workers() {
    let notifier = CountingNotifier::default();
    let registry: Registry = [
        Worker::new("polite", "/bin/sleep 30"),
        Worker::new("stubborn", "/bin/sh -c 'trap \"\" TERM; while :; do sleep 1; done'"),
    ]
    .into_iter()
    .collect();
    let policy = RestartPolicy {
        max_failures: 3,
        reset_timer: Duration::from_secs(60),
    };
    let mut sv = Supervisor::new(registry, policy, OsProcesses, &notifier);
    sv.launch_all(tokio::time::Instant::now());
    // Give the shell time to install its trap.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let pids: Vec<Pid> = sv.registry().iter().filter_map(Worker::pid).collect();
    assert_eq!(pids.len(), 2);

    let report = shutdown(sv.registry(), sv.processes(), Duration::from_millis(200)).await;
    assert_eq!(report.survivors, 0);
    assert!(report.sweeps >= 2);
    for pid in pids {
        assert!(!launcher::is_running(pid));
    }
}
