use std::collections::HashSet;
use std::path::Path;
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessesToUpdate, Signal, System, UpdateKind};

/// Returns `true` if `name` contains any of `patterns`.
///
/// Empty patterns are ignored so a blank config entry can never match every
/// process on the machine.
pub fn matches_any(name: &str, patterns: &[String]) -> bool {
    patterns
        .iter()
        .filter(|p| !p.is_empty())
        .any(|p| name.contains(p.as_str()))
}

/// Sends SIGTERM to every stray started by this launcher whose name (or
/// executable basename) contains one of `patterns`, skipping the launcher
/// itself and `exclude`.
///
/// A stray is a descendant of the launcher, or a process that was reparented
/// away from it: same session, started no earlier than the launcher. Anything
/// else on the machine is left alone even when its name matches.
///
/// Linux truncates process names to 15 bytes, so the basename of `argv[0]` is
/// checked as well. Returns the pids that were signalled.
pub fn kill_matching(patterns: &[String], exclude: &HashSet<u32>) -> Vec<u32> {
    if patterns.iter().all(|p| p.is_empty()) {
        return Vec::new();
    }

    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::new().with_cmd(UpdateKind::OnlyIfNotSet),
    );
    let Some(lineage) = Lineage::of_current(&sys) else {
        tracing::warn!("cannot find own process entry; skipping stray sweep");
        return Vec::new();
    };

    let mut signalled = Vec::new();
    for (pid, process) in sys.processes() {
        // Threads show up as entries of their own on Linux.
        if process.thread_kind().is_some() {
            continue;
        }
        if *pid == lineage.pid || exclude.contains(&pid.as_u32()) {
            continue;
        }
        let name = process.name().to_string_lossy();
        let argv0 = process
            .cmd()
            .first()
            .and_then(|a| Path::new(a).file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if !matches_any(&name, patterns) && !matches_any(&argv0, patterns) {
            continue;
        }
        if !lineage.owns(&sys, *pid, process) {
            tracing::debug!(pid = pid.as_u32(), %name, "matching process is not ours; sparing it");
            continue;
        }
        match process.kill_with(Signal::Term) {
            Some(true) => {
                tracing::info!(pid = pid.as_u32(), %name, "terminated stray process");
                signalled.push(pid.as_u32());
            }
            Some(false) => tracing::debug!(pid = pid.as_u32(), %name, "stray process already gone"),
            None => tracing::warn!("SIGTERM is not supported on this platform"),
        }
    }
    signalled
}

/// Deepest parent chain followed before giving up.
const MAX_ANCESTRY: usize = 256;

/// Identity of the running launcher, used to decide which processes it owns.
struct Lineage {
    pid: Pid,
    session: Option<Pid>,
    started_at: u64,
}

impl Lineage {
    fn of_current(sys: &System) -> Option<Self> {
        let pid = sysinfo::get_current_pid().ok()?;
        let me = sys.process(pid)?;
        Some(Self {
            pid,
            session: me.session_id(),
            started_at: me.start_time(),
        })
    }

    fn owns(&self, sys: &System, pid: Pid, process: &Process) -> bool {
        self.is_ancestor_of(sys, pid) || self.is_reparented_stray(process)
    }

    fn is_ancestor_of(&self, sys: &System, pid: Pid) -> bool {
        let mut current = pid;
        for _ in 0..MAX_ANCESTRY {
            let Some(parent) = sys.process(current).and_then(Process::parent) else {
                return false;
            };
            if parent == self.pid {
                return true;
            }
            current = parent;
        }
        false
    }

    fn is_reparented_stray(&self, process: &Process) -> bool {
        self.session.is_some()
            && process.session_id() == self.session
            && process.start_time() >= self.started_at
    }
}
