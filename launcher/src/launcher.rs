/// Connection-triggered launcher.
///
/// Follows a log for the arrival pattern and, the first time it appears,
/// waits a grace interval and starts the downstream process exactly once.
/// The run is `Done` when that process exits, fails to start, or the
/// operator stops the run. Every suspension point races the shutdown signal.
use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::error::RunError;
use crate::event::{shutdown_requested, ConnectionEvent, Latch, LauncherState};
use crate::flamegraph::Profiler;
use crate::process::CommandSpec;
use crate::status::StatusFile;
use crate::supervisor::Supervisor;
use crate::tail::{LogTail, TailLine};

/// Watched-log lines kept for failure reports.
const RECENT_LINES: usize = 20;

/// Everything the launcher needs to act once the pattern shows up.
pub struct LaunchPlan {
    pub arrival_pattern: String,
    pub grace: Duration,
    pub downstream: CommandSpec,
    /// Echo only lines containing this substring; echo all when `None`.
    pub echo_filter: Option<String>,
    pub liveness_interval: Duration,
    /// Written when the latch trips and removed during teardown.
    pub marker_path: Option<PathBuf>,
    pub profiler: Option<Profiler>,
}

pub struct Launcher {
    plan: LaunchPlan,
    state: LauncherState,
    latch: Latch,
    recent: VecDeque<String>,
    connection: Option<ConnectionEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Launcher {
    pub fn new(plan: LaunchPlan, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            plan,
            state: LauncherState::Waiting,
            latch: Latch::new(),
            recent: VecDeque::with_capacity(RECENT_LINES),
            connection: None,
            shutdown,
        }
    }

    pub fn state(&self) -> LauncherState {
        self.state
    }

    /// The event that tripped the latch, if any.
    pub fn connection(&self) -> Option<&ConnectionEvent> {
        self.connection.as_ref()
    }

    pub fn recent_lines(&self) -> Vec<String> {
        self.recent.iter().cloned().collect()
    }

    /// Drives one run to `Done`. Never spawns more than one downstream process.
    pub async fn run(
        &mut self,
        supervisor: &mut Supervisor,
        tail: &mut LogTail,
        status: &mut StatusFile,
    ) -> Result<(), RunError> {
        let result = self.drive(supervisor, tail, status).await;
        self.state = LauncherState::Done;

        match &result {
            Ok(()) => status.update(|s| {
                s.state = LauncherState::Done;
                s.exit_code = Some(0);
            }),
            Err(e) => {
                let lines = self.recent_lines();
                if !lines.is_empty() {
                    tracing::error!(
                        "last lines of {} (read {}):\n{}",
                        tail.path().display(),
                        tail.line_number(),
                        lines.join("\n")
                    );
                }
                let message = e.to_string();
                let code = match e {
                    RunError::Downstream { code } => *code,
                    _ => None,
                };
                status.update(|s| {
                    s.state = LauncherState::Done;
                    s.error = Some(message);
                    s.exit_code = code;
                    s.last_lines = lines;
                });
            }
        }
        result
    }

    async fn drive(
        &mut self,
        supervisor: &mut Supervisor,
        tail: &mut LogTail,
        status: &mut StatusFile,
    ) -> Result<(), RunError> {
        self.state = LauncherState::Waiting;
        status.update(|s| s.state = LauncherState::Waiting);
        tracing::info!(pattern = %self.plan.arrival_pattern, "waiting for peer");

        let mut liveness = tokio::time::interval(self.plan.liveness_interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let event = loop {
            tokio::select! {
                line = tail.next_line() => {
                    let line = line.map_err(|e| {
                        RunError::Setup(format!("watched log became unreadable: {e}"))
                    })?;
                    let Some(line) = line else {
                        return Err(RunError::Interrupted);
                    };
                    if let Some(event) = self.observe(&line) {
                        break event;
                    }
                }
                _ = liveness.tick() => {
                    let dead = supervisor.reap_companions();
                    if dead.is_empty() {
                        continue;
                    }
                    for dead in dead {
                        tracing::warn!(
                            name = dead.name(),
                            pid = dead.pid(),
                            started_at = %dead.started_at().to_rfc3339(),
                            status = ?dead.exit_status(),
                            "companion exited while waiting"
                        );
                    }
                    status.update(|s| s.companions = supervisor.companions());
                }
            }
        };

        tracing::info!(
            line = event.line_number,
            pattern = %event.matched,
            text = %event.raw,
            "peer connected"
        );
        status.update(|s| s.connection_line = Some(event.raw.clone()));
        if let Some(marker) = &self.plan.marker_path {
            let content = format!("{}\n{}\n", event.observed_at.to_rfc3339(), event.raw);
            match std::fs::write(marker, content) {
                Ok(()) => supervisor.track_artifact(marker.clone()),
                Err(e) => tracing::warn!("Failed to write {}: {e}", marker.display()),
            }
        }
        self.connection = Some(event);

        tokio::select! {
            biased;
            _ = shutdown_requested(&mut self.shutdown) => return Err(RunError::Interrupted),
            _ = tokio::time::sleep(self.plan.grace) => {}
        }

        let pid = supervisor.launch_downstream(&self.plan.downstream)?;
        self.state = LauncherState::Launched;
        status.update(|s| {
            s.state = LauncherState::Launched;
            s.downstream_pid = Some(pid);
        });

        let mut capture = self
            .plan
            .profiler
            .clone()
            .map(|profiler| tokio::spawn(profiler.capture(pid)));

        let waited = tokio::select! {
            res = supervisor.wait_downstream() => res,
            _ = shutdown_requested(&mut self.shutdown) => {
                if let Some(handle) = capture.take() {
                    handle.abort();
                }
                return Err(RunError::Interrupted);
            }
        };

        let outcome = match waited {
            Some(Ok(exit)) if exit.success() => {
                tracing::info!(pid, "downstream exited cleanly");
                Ok(())
            }
            Some(Ok(exit)) => {
                tracing::warn!(pid, %exit, "downstream failed");
                Err(RunError::Downstream { code: exit.code() })
            }
            Some(Err(e)) => {
                tracing::error!(pid, "waiting on downstream failed: {e}");
                Err(RunError::Downstream { code: None })
            }
            None => Err(RunError::Downstream { code: None }),
        };

        if let Some(mut handle) = capture {
            tokio::select! {
                joined = &mut handle => match joined {
                    Ok(Ok(svg)) => status.update(|s| s.flamegraph = Some(svg.display().to_string())),
                    Ok(Err(e)) => tracing::warn!("flame graph capture failed: {e:#}"),
                    Err(e) => tracing::warn!("flame graph task ended abnormally: {e}"),
                },
                _ = shutdown_requested(&mut self.shutdown) => {
                    handle.abort();
                    return Err(RunError::Interrupted);
                }
            }
        }

        outcome
    }

    /// Records and echoes `line`; returns an event only when it trips the latch.
    fn observe(&mut self, line: &TailLine) -> Option<ConnectionEvent> {
        if self.recent.len() == RECENT_LINES {
            self.recent.pop_front();
        }
        self.recent.push_back(line.text.clone());

        self.echo(&mut std::io::stdout().lock(), &line.text);

        if self.latch.is_tripped() {
            return None;
        }
        let event = ConnectionEvent::detect(&line.text, &self.plan.arrival_pattern, line.number)?;
        self.latch.trip().then_some(event)
    }

    /// A closed stdout only loses the echo; the run carries on.
    fn echo(&self, out: &mut impl Write, text: &str) {
        if !self.should_echo(text) {
            return;
        }
        if let Err(e) = writeln!(out, "{text}") {
            tracing::debug!("echo dropped: {e}");
        }
    }

    fn should_echo(&self, text: &str) -> bool {
        match &self.plan.echo_filter {
            Some(filter) => text.contains(filter.as_str()),
            None => true,
        }
    }
}
