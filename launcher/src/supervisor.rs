/// Single owner of every process the launcher starts.
///
/// Companions are started before the log is watched, the downstream process
/// once the latch trips. Teardown runs exactly once per supervisor, either
/// explicitly or from `Drop`, and in a fixed order:
///   1. SIGTERM every process still held ("already dead" is not an error)
///   2. sweep the process table for strays matching the kill patterns
///   3. remove registered marker artifacts
use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use crate::error::RunError;
use crate::process::{CommandSpec, ObservedProcess};
use crate::process_monitor;
use crate::status::CompanionStatus;

/// What a teardown did.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Handles that were sent SIGTERM, returned so they can be reaped.
    pub signalled: Vec<ObservedProcess>,
    /// Pids of stray processes terminated by pattern.
    pub strays: Vec<u32>,
    pub removed: Vec<PathBuf>,
}

pub struct Supervisor {
    companions: Vec<ObservedProcess>,
    downstream: Option<ObservedProcess>,
    artifacts: Vec<PathBuf>,
    kill_patterns: Vec<String>,
    torn_down: bool,
}

impl Supervisor {
    pub fn new(kill_patterns: Vec<String>) -> Self {
        Self {
            companions: Vec::new(),
            downstream: None,
            artifacts: Vec::new(),
            kill_patterns,
            torn_down: false,
        }
    }

    /// Starts a long-lived companion and takes ownership of it.
    pub fn start_companion(&mut self, name: &str, spec: &CommandSpec) -> Result<u32, RunError> {
        if self.torn_down {
            return Err(RunError::Interrupted);
        }
        let process = ObservedProcess::spawn(name, spec)
            .map_err(|e| RunError::Setup(format!("companion '{name}' (`{spec}`) failed to start: {e}")))?;
        let pid = process.pid();
        tracing::info!(name, pid, "companion started");
        self.companions.push(process);
        Ok(pid)
    }

    /// Starts the downstream process. Only one may ever be started.
    pub fn launch_downstream(&mut self, spec: &CommandSpec) -> Result<u32, RunError> {
        if self.torn_down {
            return Err(RunError::Interrupted);
        }
        if self.downstream.is_some() {
            return Err(RunError::Launch {
                command: spec.to_string(),
                source: io::Error::new(io::ErrorKind::AlreadyExists, "downstream already launched"),
            });
        }
        let process = ObservedProcess::spawn("downstream", spec).map_err(|source| RunError::Launch {
            command: spec.to_string(),
            source,
        })?;
        let pid = process.pid();
        tracing::info!(pid, command = %spec, "downstream launched");
        self.downstream = Some(process);
        Ok(pid)
    }

    pub fn downstream_pid(&self) -> Option<u32> {
        self.downstream.as_ref().map(ObservedProcess::pid)
    }

    /// Suspends until the downstream process exits.
    /// Returns `None` when no downstream process was launched.
    pub async fn wait_downstream(&mut self) -> Option<io::Result<ExitStatus>> {
        match self.downstream.as_mut() {
            Some(p) => Some(p.wait().await),
            None => None,
        }
    }

    pub fn companions(&self) -> Vec<CompanionStatus> {
        self.companions
            .iter()
            .map(|p| CompanionStatus {
                name: p.name().to_string(),
                pid: p.pid(),
            })
            .collect()
    }

    /// Non-blocking liveness sweep. Companions found dead are removed from
    /// tracking and returned.
    pub fn reap_companions(&mut self) -> Vec<ObservedProcess> {
        let mut dead = Vec::new();
        let mut alive = Vec::with_capacity(self.companions.len());
        for mut p in self.companions.drain(..) {
            if p.is_alive() {
                alive.push(p);
            } else {
                dead.push(p);
            }
        }
        self.companions = alive;
        dead
    }

    /// Registers a file to delete during teardown.
    pub fn track_artifact(&mut self, path: PathBuf) {
        self.artifacts.push(path);
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Releases everything the supervisor holds. A second call does nothing.
    pub fn teardown(&mut self) -> TeardownReport {
        if self.torn_down {
            return TeardownReport::default();
        }
        self.torn_down = true;

        let mut report = TeardownReport::default();
        let held = self.companions.drain(..).chain(self.downstream.take());
        for mut p in held {
            if !p.is_alive() {
                continue;
            }
            match p.terminate() {
                Ok(()) => tracing::info!(name = p.name(), pid = p.pid(), "sent SIGTERM"),
                Err(e) => tracing::warn!(name = p.name(), pid = p.pid(), "SIGTERM failed: {e}"),
            }
            report.signalled.push(p);
        }

        let exclude: HashSet<u32> = report.signalled.iter().map(ObservedProcess::pid).collect();
        report.strays = process_monitor::kill_matching(&self.kill_patterns, &exclude);

        for path in self.artifacts.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => report.removed.push(path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove {}: {e}", path.display()),
            }
        }
        report
    }

    /// Tears down, then waits up to `grace` for signalled processes to exit,
    /// escalating to SIGKILL for any that are still running.
    pub async fn shutdown(&mut self, grace: Duration) -> TeardownReport {
        let mut report = self.teardown();
        for p in &mut report.signalled {
            if tokio::time::timeout(grace, p.wait()).await.is_err() {
                tracing::warn!(name = p.name(), pid = p.pid(), "ignored SIGTERM; killing");
                if let Err(e) = p.force_kill() {
                    tracing::warn!(name = p.name(), "SIGKILL failed: {e}");
                }
                let _ = p.wait().await;
            }
        }
        report
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if !self.is_torn_down() {
            let _ = self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn sleeper() -> CommandSpec {
        CommandSpec::new("sleep").arg("30")
    }

    // ── start / launch ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn companion_spawn_failure_is_setup_error() {
        let mut sup = Supervisor::new(Vec::new());
        let err = sup
            .start_companion("ghost", &CommandSpec::new("/nonexistent/peer-launcher-ghost"))
            .unwrap_err();
        assert!(matches!(err, RunError::Setup(_)));
        assert!(sup.companions().is_empty());
    }

    #[tokio::test]
    async fn downstream_spawn_failure_is_launch_error() {
        let mut sup = Supervisor::new(Vec::new());
        let err = sup
            .launch_downstream(&CommandSpec::new("/nonexistent/peer-launcher-sender"))
            .unwrap_err();
        assert!(matches!(err, RunError::Launch { .. }));
        assert!(sup.downstream_pid().is_none());
        assert!(sup.wait_downstream().await.is_none());
    }

    #[tokio::test]
    async fn downstream_launches_at_most_once() {
        let mut sup = Supervisor::new(Vec::new());
        sup.launch_downstream(&CommandSpec::new("true")).unwrap();
        let err = sup.launch_downstream(&CommandSpec::new("true")).unwrap_err();
        assert!(matches!(err, RunError::Launch { .. }));
        let status = sup.wait_downstream().await.unwrap().unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn nothing_spawns_after_teardown() {
        let mut sup = Supervisor::new(Vec::new());
        sup.teardown();
        assert!(matches!(
            sup.launch_downstream(&CommandSpec::new("true")),
            Err(RunError::Interrupted)
        ));
        assert!(matches!(
            sup.start_companion("late", &sleeper()),
            Err(RunError::Interrupted)
        ));
    }

    // ── liveness ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn reap_removes_only_dead_companions() {
        let mut sup = Supervisor::new(Vec::new());
        sup.start_companion("long", &sleeper()).unwrap();
        sup.start_companion("short", &CommandSpec::new("true")).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let dead = sup.reap_companions();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].name(), "short");
        let names: Vec<_> = sup.companions().into_iter().map(|c| c.name).collect();
        assert_eq!(names, ["long"]);
        sup.shutdown(Duration::from_secs(5)).await;
    }

    // ── teardown ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn teardown_terminates_companions_and_downstream() {
        let mut sup = Supervisor::new(Vec::new());
        sup.start_companion("display", &sleeper()).unwrap();
        sup.start_companion("signaling", &sleeper()).unwrap();
        sup.launch_downstream(&sleeper()).unwrap();

        let report = sup.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report.signalled.len(), 3);
        for p in &report.signalled {
            let status = p.exit_status().unwrap();
            assert_eq!(status.signal(), Some(nix::sys::signal::Signal::SIGTERM as i32));
        }
        assert!(sup.companions().is_empty());
        assert!(sup.downstream_pid().is_none());
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let mut sup = Supervisor::new(Vec::new());
        sup.start_companion("display", &sleeper()).unwrap();

        let first = sup.shutdown(Duration::from_secs(5)).await;
        assert_eq!(first.signalled.len(), 1);
        assert!(sup.is_torn_down());

        let second = sup.teardown();
        assert!(second.signalled.is_empty());
        assert!(second.strays.is_empty());
        assert!(second.removed.is_empty());
    }

    #[tokio::test]
    async fn teardown_skips_processes_already_exited() {
        let mut sup = Supervisor::new(Vec::new());
        sup.start_companion("quick", &CommandSpec::new("true")).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let report = sup.teardown();
        assert!(report.signalled.is_empty());
    }

    #[tokio::test]
    async fn teardown_removes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("connected.flag");
        std::fs::write(&marker, "1").unwrap();
        let missing = dir.path().join("never-written.flag");

        let mut sup = Supervisor::new(Vec::new());
        sup.track_artifact(marker.clone());
        sup.track_artifact(missing);

        let report = sup.teardown();
        assert_eq!(report.removed, vec![marker.clone()]);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn drop_runs_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("connected.flag");
        std::fs::write(&marker, "1").unwrap();

        {
            let mut sup = Supervisor::new(Vec::new());
            sup.track_artifact(marker.clone());
        }
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn shutdown_escalates_when_sigterm_is_ignored() {
        let mut sup = Supervisor::new(Vec::new());
        let stubborn = CommandSpec::new("sh")
            .arg("-c")
            .arg("trap '' TERM; while :; do sleep 1; done");
        sup.start_companion("stubborn", &stubborn).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let report = sup.shutdown(Duration::from_millis(300)).await;
        let status = report.signalled[0].exit_status().unwrap();
        assert_eq!(status.signal(), Some(nix::sys::signal::Signal::SIGKILL as i32));
    }
}
