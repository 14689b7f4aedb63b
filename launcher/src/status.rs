use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::event::LauncherState;

/// A companion process as recorded in the status file.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CompanionStatus {
    pub name: String,
    pub pid: u32,
}

/// Run status written to `<run_dir>/status.toml` at every transition.
/// Operators and wrapper scripts read this file to see how a run ended.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunStatus {
    /// Launcher binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub role: String,
    pub state: LauncherState,
    /// RFC 3339 timestamp of launcher start.
    pub started_at: String,
    /// RFC 3339 timestamp of the last write.
    pub updated_at: String,
    /// The watched-log line that tripped the latch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_line: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downstream_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flamegraph: Option<String>,
    /// JSON summary derived from the sender's log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_report: Option<String>,
    /// Human-readable description of the terminal error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Most recent watched-log lines, recorded on failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub last_lines: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub companions: Vec<CompanionStatus>,
}

impl RunStatus {
    /// Constructs the initial waiting status for `role`.
    pub fn new(role: &str) -> Self {
        let now = chrono::Local::now().to_rfc3339();
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            role: role.to_string(),
            state: LauncherState::Waiting,
            started_at: now.clone(),
            updated_at: now,
            connection_line: None,
            downstream_pid: None,
            exit_code: None,
            flamegraph: None,
            log_report: None,
            error: None,
            last_lines: Vec::new(),
            companions: Vec::new(),
        }
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Logs errors rather than failing: a status write must never abort a run.
pub fn write_status(path: &Path, status: &RunStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!("Failed to create directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                tracing::warn!("Failed to write status file: {e}");
            }
        }
        Err(e) => tracing::warn!("Failed to serialize status: {e}"),
    }
}

/// A `RunStatus` paired with the file it is mirrored to.
pub struct StatusFile {
    path: Option<PathBuf>,
    status: RunStatus,
}

impl StatusFile {
    pub fn new(path: PathBuf, role: &str) -> Self {
        let file = Self {
            path: Some(path),
            status: RunStatus::new(role),
        };
        file.flush();
        file
    }

    /// A status that is tracked in memory only.
    pub fn detached(role: &str) -> Self {
        Self {
            path: None,
            status: RunStatus::new(role),
        }
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    /// Applies `f`, stamps `updated_at`, and rewrites the file.
    pub fn update(&mut self, f: impl FnOnce(&mut RunStatus)) {
        f(&mut self.status);
        self.status.updated_at = chrono::Local::now().to_rfc3339();
        self.flush();
    }

    fn flush(&self) {
        if let Some(path) = &self.path {
            write_status(path, &self.status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── RunStatus::new ────────────────────────────────────────────────────────

    #[test]
    fn new_starts_waiting() {
        let s = RunStatus::new("server");
        assert_eq!(s.state, LauncherState::Waiting);
        assert_eq!(s.role, "server");
        assert_eq!(s.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn new_has_no_optional_fields() {
        let s = RunStatus::new("server");
        assert!(s.connection_line.is_none());
        assert!(s.downstream_pid.is_none());
        assert!(s.exit_code.is_none());
        assert!(s.log_report.is_none());
        assert!(s.error.is_none());
        assert!(s.last_lines.is_empty());
        assert!(s.companions.is_empty());
    }

    // ── write_status ──────────────────────────────────────────────────────────

    #[test]
    fn write_status_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("status.toml");
        write_status(&path, &RunStatus::new("server"));
        assert!(path.exists());
    }

    #[test]
    fn write_status_omits_none_optional_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");
        write_status(&path, &RunStatus::new("server"));

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("state = \"waiting\""));
        assert!(!content.contains("downstream_pid"));
        assert!(!content.contains("error"));
        assert!(!content.contains("last_lines"));
    }

    #[test]
    fn write_status_content_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");

        let mut original = RunStatus::new("server");
        original.state = LauncherState::Done;
        original.downstream_pid = Some(4242);
        original.exit_code = Some(0);
        original.last_lines = vec!["ping".to_string()];
        original.companions = vec![CompanionStatus {
            name: "signaling".to_string(),
            pid: 17,
        }];
        write_status(&path, &original);

        let parsed: RunStatus = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.state, LauncherState::Done);
        assert_eq!(parsed.downstream_pid, Some(4242));
        assert_eq!(parsed.last_lines, ["ping"]);
        assert_eq!(parsed.companions, original.companions);
    }

    // ── StatusFile ────────────────────────────────────────────────────────────

    #[test]
    fn status_file_writes_on_creation_and_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");
        let mut file = StatusFile::new(path.clone(), "server");
        assert!(path.exists());

        file.update(|s| {
            s.state = LauncherState::Launched;
            s.downstream_pid = Some(99);
        });
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("state = \"launched\""));
        assert!(content.contains("downstream_pid = 99"));
    }

    #[test]
    fn detached_status_touches_no_file() {
        let mut file = StatusFile::detached("server");
        file.update(|s| s.state = LauncherState::Done);
        assert_eq!(file.status().state, LauncherState::Done);
    }
}
