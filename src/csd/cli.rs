use crate::csd::build_info;
use crate::csd::config::{self, SupervisorConfig};
use crate::csd::daemon;
use crate::csd::launcher::OsProcesses;
use crate::csd::notify::SendmailNotifier;
use crate::csd::registry::{Registry, Worker};
use crate::csd::relay::LogRelay;
use crate::csd::shutdown::{self, GRACE};
use crate::csd::signals::SignalBridge;
use crate::csd::singleton::{LockError, LockFile};
use crate::csd::supervisor::{RestartPolicy, Supervisor};
use anyhow::Context as _;
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Parser)]
#[command(name = "camsrvd", version, about = "camera stream-capture supervisor")]
pub struct Args {
    /// Path to the camera roster YAML
    pub config: PathBuf,

    /// Stay attached to the terminal and log to stderr instead of syslog
    #[arg(short = 'f', long = "foreground")]
    pub foreground: bool,
}

/// Entry point for the `camsrvd` binary.
pub fn run() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            // --help and --version are not errors.
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    init_tracing(args.foreground);
    run_with(&args)
}

fn init_tracing(foreground: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let ansi = foreground && std::io::stderr().is_terminal();
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_target(false);
    // syslog stamps its own time.
    let result = if foreground {
        tracing_subscriber::registry().with(env_filter).with(layer).try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.without_time())
            .try_init()
    };
    if let Err(err) = result {
        eprintln!("tracing init skipped: {err}");
    }
}

fn run_with(args: &Args) -> ExitCode {
    let cfg = match config::load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    if !args.foreground
        && let Err(e) = daemon::daemonize()
    {
        tracing::error!("unable to daemonize: {e:#}");
        return ExitCode::FAILURE;
    }

    let lock = match LockFile::acquire(&cfg.lock_file) {
        Ok(lock) => lock,
        Err(e @ LockError::AlreadyRunning { .. }) => {
            tracing::error!("{e}; refusing to start");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            tracing::error!("unable to set up singleton lock: {e}");
            return ExitCode::FAILURE;
        }
    };

    let relay = if args.foreground {
        None
    } else {
        match LogRelay::start() {
            Ok(relay) => Some(relay),
            Err(e) => {
                tracing::error!("unable to start log relay: {e:#}");
                return ExitCode::FAILURE;
            }
        }
    };

    let code = match supervise(&cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    };
    tracing::info!(lock_file = %lock.path().display(), "exiting");

    drop(lock);
    if let Some(relay) = relay {
        // stderr already points at /dev/null, so a failure here cannot be reported.
        let _ = relay.finish();
    }
    code
}

/// Everything after the process has settled: runtime, signals, launch, loop, shutdown.
fn supervise(cfg: &SupervisorConfig) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    rt.block_on(supervise_async(cfg))
}

async fn supervise_async(cfg: &SupervisorConfig) -> anyhow::Result<()> {
    // Installed before any worker exists so no exit or termination request is missed.
    let mut bridge = SignalBridge::install().context("install signal handlers")?;

    tracing::info!(
        pid = std::process::id(),
        build_host = build_info::build_host(),
        build_time = %build_info::build_time_pretty(),
        workers = cfg.workers.len(),
        "{}",
        build_info::banner()
    );

    let registry: Registry = cfg
        .workers
        .iter()
        .map(|w| Worker::new(&w.name, &w.command))
        .collect();
    let policy = RestartPolicy {
        max_failures: cfg.max_failures,
        reset_timer: cfg.reset_timer,
    };
    let notifier = SendmailNotifier::new(cfg.notifier.clone(), cfg.mail_to.clone());
    let mut sv = Supervisor::new(registry, policy, OsProcesses, notifier);

    sv.launch_all(tokio::time::Instant::now());
    let exit = sv.run(&mut bridge).await;
    tracing::info!(reason = exit.as_str(), "supervision loop finished");

    let report = shutdown::shutdown(sv.registry(), sv.processes(), GRACE).await;
    tracing::info!(
        sweeps = report.sweeps,
        signals_sent = report.signals_sent,
        survivors = report.survivors,
        "shutdown complete"
    );
    Ok(())
}
