mod config;
mod error;
mod event;
mod flamegraph;
mod launcher;
mod log_report;
mod paths;
mod process;
mod process_monitor;
mod status;
mod supervisor;
mod tail;
#[cfg(test)]
mod test_support;
mod video;

use clap::{ArgAction, Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Config;
use crate::error::RunError;
use crate::event::{shutdown_requested, LauncherState};
use crate::flamegraph::Profiler;
use crate::launcher::{LaunchPlan, Launcher};
use crate::log_report::LogReport;
use crate::status::StatusFile;
use crate::supervisor::Supervisor;
use crate::tail::LogTail;
use crate::video::VideoJob;

/// How long signalled processes get to exit before SIGKILL.
const REAP_GRACE: Duration = Duration::from_secs(3);
/// Lines of a dead companion's log shown in the startup failure report.
const COMPANION_LOG_LINES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Start companions, wait for a peer, then launch the sender.
    Server,
    /// Build the looped raw-video input for the sender.
    Video,
    /// Turn a finished sender log into a flame graph and JSON summary.
    Report,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Video => "video",
            Role::Report => "report",
        }
    }

    /// Profiling window for `server`, looped length for `video`; unused by `report`.
    fn default_duration_secs(self) -> u64 {
        match self {
            Role::Server => 30,
            Role::Video => 60,
            Role::Report => 0,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "peer-launcher", version, about = "Launch a WebRTC sender when a peer connects")]
struct Args {
    #[arg(value_enum)]
    role: Role,

    /// Duration in seconds (default: 30 for server, 60 for video)
    duration: Option<u64>,

    /// Configuration file; defaults apply when it does not exist
    #[arg(short, long, value_name = "FILE", default_value = "peer-launcher.toml")]
    config: PathBuf,

    /// Overrides general.run_dir
    #[arg(long, value_name = "DIR")]
    run_dir: Option<PathBuf>,

    /// Log analysed by `report` (default: newest sender log in the run directory)
    #[arg(long, value_name = "FILE")]
    log: Option<PathBuf>,

    /// Enable verbose logging (-v, -vv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e:#}");
            return ExitCode::from(error::EXIT_SETUP);
        }
    };

    // ── Shutdown on SIGINT / SIGTERM ──────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(listen_for_signals(shutdown_tx));

    tracing::info!(
        role = args.role.as_str(),
        "peer-launcher v{} started",
        env!("CARGO_PKG_VERSION")
    );

    let secs = args
        .duration
        .unwrap_or_else(|| args.role.default_duration_secs());
    let result = match args.role {
        Role::Server => run_server(&config, Duration::from_secs(secs), shutdown_rx).await,
        Role::Video => run_video(&config, secs, shutdown_rx).await,
        Role::Report => run_report(&config, args.log.as_deref(), shutdown_rx).await,
    };

    match result {
        Ok(()) => {
            tracing::info!("run complete");
            ExitCode::from(error::EXIT_SUCCESS)
        }
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => "peer_launcher=info",
        1 => "peer_launcher=debug",
        _ => "peer_launcher=trace",
    };

    // RUST_LOG takes priority over -v
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
    {
        eprintln!("failed to initialize tracing: {err}");
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = config::load_or_default(&args.config)?;
    if let Some(dir) = &args.run_dir {
        config.general.run_dir = dir.to_string_lossy().into_owned();
    }
    if args.role == Role::Server {
        config.validate()?;
    }
    Ok(config)
}

/// Flips the shutdown flag on every SIGINT or SIGTERM.
async fn listen_for_signals(tx: watch::Sender<bool>) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!("cannot listen for SIGTERM: {e}");
            None
        }
    };

    loop {
        let name = tokio::select! {
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => "SIGINT",
                Err(e) => {
                    tracing::warn!("cannot listen for SIGINT: {e}");
                    break;
                }
            },
            Some(()) = next_signal(&mut sigterm) => "SIGTERM",
        };
        if tx.send_replace(true) {
            tracing::info!("{name} received; teardown already in progress");
        } else {
            tracing::info!("{name} received; stopping");
        }
    }

    // A dropped sender reads as a shutdown request, so hold on to it.
    std::future::pending::<()>().await;
}

async fn next_signal(sig: &mut Option<Signal>) -> Option<()> {
    match sig {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}

// ── server role ───────────────────────────────────────────────────────────────

async fn run_server(
    config: &Config,
    profile_for: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<(), RunError> {
    let run_dir = config.run_dir();
    std::fs::create_dir_all(&run_dir).map_err(|e| {
        RunError::Setup(format!("cannot create run directory {}: {e}", run_dir.display()))
    })?;

    let mut status = StatusFile::new(paths::status_file_path(&run_dir), Role::Server.as_str());
    let mut supervisor = Supervisor::new(config.general.kill_patterns.clone());

    let result = serve(
        config,
        &run_dir,
        profile_for,
        &mut supervisor,
        &mut status,
        shutdown,
    )
    .await;

    let report = supervisor.shutdown(REAP_GRACE).await;
    tracing::info!(
        signalled = report.signalled.len(),
        strays = report.strays.len(),
        removed = report.removed.len(),
        "teardown complete"
    );

    status.update(|s| {
        s.state = LauncherState::Done;
        if let Err(e) = &result {
            if s.error.is_none() {
                s.error = Some(e.to_string());
            }
        }
    });
    result
}

async fn serve(
    config: &Config,
    run_dir: &Path,
    profile_for: Duration,
    supervisor: &mut Supervisor,
    status: &mut StatusFile,
    shutdown: watch::Receiver<bool>,
) -> Result<(), RunError> {
    let ph = config.placeholders();

    for companion in &config.companions {
        let spec = companion.to_spec(&ph, run_dir);
        supervisor.start_companion(&companion.name, &spec)?;
    }
    status.update(|s| s.companions = supervisor.companions());

    let mut rx = shutdown.clone();
    tokio::select! {
        biased;
        _ = shutdown_requested(&mut rx) => return Err(RunError::Interrupted),
        _ = tokio::time::sleep(config.launcher.startup_delay()) => {}
    }

    let dead = supervisor.reap_companions();
    if let Some(first) = dead.first() {
        for p in &dead {
            tracing::error!(
                name = p.name(),
                pid = p.pid(),
                status = ?p.exit_status(),
                "companion exited during startup"
            );
            if let Some(log) = &p.command().log_path {
                for line in tail::last_lines(log, COMPANION_LOG_LINES) {
                    tracing::error!("  {line}");
                }
            }
        }
        return Err(RunError::Setup(format!(
            "companion '{}' exited during startup",
            first.name()
        )));
    }

    let watched = config
        .watched_log_path()
        .ok_or_else(|| RunError::Setup("no log to watch".to_string()))?;
    let mut tail = LogTail::open(
        &watched,
        config.launcher.log_wait(),
        config.launcher.poll_interval(),
        shutdown.clone(),
    )
    .await?;

    let timestamp = paths::local_timestamp();
    let profiler = config.profiler.enabled.then(|| {
        Profiler::new(
            config.profiler.clone(),
            profile_for,
            paths::profile_stem(run_dir, &timestamp),
        )
    });
    let downstream_log = paths::downstream_log_path(run_dir, &timestamp);
    let plan = LaunchPlan {
        arrival_pattern: config.launcher.arrival_pattern.clone(),
        grace: config.launcher.grace(),
        downstream: config
            .launcher
            .downstream
            .to_spec(&ph, Some(downstream_log.clone())),
        echo_filter: config.general.echo_filter.clone(),
        liveness_interval: config.launcher.liveness_interval(),
        marker_path: Some(paths::marker_file_path(run_dir)),
        profiler,
    };

    let mut rx = shutdown.clone();
    let mut launcher = Launcher::new(plan, shutdown);
    let result = launcher.run(supervisor, &mut tail, status).await;
    tracing::debug!(
        state = ?launcher.state(),
        connected = launcher.connection().is_some(),
        "launcher finished"
    );

    let launched = status.status().downstream_pid.is_some();
    if config.log_report.enabled && launched && !matches!(result, Err(RunError::Interrupted)) {
        let stem = paths::log_report_stem(run_dir, &timestamp);
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut rx) => return Err(RunError::Interrupted),
            _ = report_sender_log(config, &downstream_log, stem, status) => {}
        }
    }
    result
}

/// Summarises the sender's log after it exits. Failures are only logged.
async fn report_sender_log(config: &Config, log: &Path, stem: PathBuf, status: &mut StatusFile) {
    let report = match LogReport::new(config.log_report.clone(), &config.profiler, stem) {
        Ok(report) => report,
        Err(e) => {
            tracing::warn!("log report unavailable: {e:#}");
            return;
        }
    };
    match report.generate(log).await {
        Ok(Some(artifacts)) => {
            tracing::info!(
                report = %artifacts.report.display(),
                svg = ?artifacts.svg,
                events = artifacts.events,
                "log report written"
            );
            status.update(|s| s.log_report = Some(artifacts.report.display().to_string()));
        }
        Ok(None) => {}
        Err(e) => tracing::warn!("log report failed: {e:#}"),
    }
}

// ── video role ────────────────────────────────────────────────────────────────

async fn run_video(
    config: &Config,
    secs: u64,
    shutdown: watch::Receiver<bool>,
) -> Result<(), RunError> {
    let out = VideoJob::new(config.video.clone(), secs).run(shutdown).await?;
    println!("{}", out.display());
    Ok(())
}

// ── report role ───────────────────────────────────────────────────────────────

async fn run_report(
    config: &Config,
    log: Option<&Path>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RunError> {
    let run_dir = config.run_dir();
    let log = match log {
        Some(path) => path.to_path_buf(),
        None => paths::latest_downstream_log(&run_dir).ok_or_else(|| {
            RunError::Setup(format!("no sender log in {}; pass --log", run_dir.display()))
        })?,
    };
    if !log.is_file() {
        return Err(RunError::Setup(format!("log file {} does not exist", log.display())));
    }
    std::fs::create_dir_all(&run_dir).map_err(|e| {
        RunError::Setup(format!("cannot create run directory {}: {e}", run_dir.display()))
    })?;

    let stem = paths::log_report_stem(&run_dir, &paths::local_timestamp());
    let report = LogReport::new(config.log_report.clone(), &config.profiler, stem)
        .map_err(|e| RunError::Setup(format!("{e:#}")))?;

    let generated = tokio::select! {
        biased;
        _ = shutdown_requested(&mut shutdown) => return Err(RunError::Interrupted),
        res = report.generate(&log) => res,
    };
    match generated {
        Ok(Some(artifacts)) => {
            println!("{}", artifacts.report.display());
            if let Some(svg) = &artifacts.svg {
                println!("{}", svg.display());
            }
            Ok(())
        }
        Ok(None) => Err(RunError::Setup(format!(
            "no timing events found in {}",
            log.display()
        ))),
        Err(e) => Err(RunError::Setup(format!("{e:#}"))),
    }
}
