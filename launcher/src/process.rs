/// Handles to external processes started by the launcher.
///
/// Every child gets its stdout and stderr appended to a dedicated log file
/// (or discarded), and can be checked for liveness, sent SIGTERM, or awaited
/// at any later point while the handle is held.
use chrono::{DateTime, Local};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output, Stdio};
use tokio::process::{Child, Command};

/// How to launch an external process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// File receiving the child's stdout and stderr. `None` discards output.
    pub log_path: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            log_path: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn log_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A process started by the launcher and still owned by it.
#[derive(Debug)]
pub struct ObservedProcess {
    name: String,
    pid: u32,
    command: CommandSpec,
    started_at: DateTime<Local>,
    child: Child,
    exit: Option<ExitStatus>,
}

impl ObservedProcess {
    /// Starts `spec`, wiring its output to `spec.log_path`.
    pub fn spawn(name: &str, spec: &CommandSpec) -> io::Result<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());

        match &spec.log_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let out = OpenOptions::new().create(true).append(true).open(path)?;
                let err = out.try_clone()?;
                cmd.stdout(Stdio::from(out)).stderr(Stdio::from(err));
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "spawned process has no pid"))?;

        tracing::debug!(name, pid, command = %spec, "spawned");
        Ok(Self {
            name: name.to_string(),
            pid,
            command: spec.clone(),
            started_at: Local::now(),
            child,
            exit: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Exit status, if the process has been observed to terminate.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Non-blocking liveness check. Records the exit status once it is known.
    pub fn is_alive(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(name = %self.name, pid = self.pid, "liveness check failed: {e}");
                false
            }
        }
    }

    /// Sends SIGTERM. A process that is already gone is not an error.
    pub fn terminate(&self) -> io::Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        let pid = i32::try_from(self.pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    /// Sends SIGKILL. Used only once a SIGTERM has been ignored for too long.
    pub fn force_kill(&mut self) -> io::Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        self.child.start_kill()
    }

    /// Suspends until the process exits.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exit = Some(status);
        Ok(status)
    }
}

/// Runs `spec` to completion, capturing stderr.
///
/// Stdout goes to `stdout_to` when given and is captured otherwise. The child
/// is killed if the returned future is dropped, so callers may race this
/// against a shutdown signal.
pub async fn run_step(spec: &CommandSpec, stdout_to: Option<&Path>) -> io::Result<Output> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    match stdout_to {
        Some(path) => {
            cmd.stdout(Stdio::from(std::fs::File::create(path)?));
        }
        None => {
            cmd.stdout(Stdio::piped());
        }
    }
    tracing::debug!(command = %spec, "running step");
    // `Command::output` would re-pipe stdout over the redirect above.
    cmd.spawn()?.wait_with_output().await
}

/// Last `n` lines of `bytes`, for error reports.
pub fn tail_text(bytes: &[u8], n: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::time::Duration;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn display_joins_program_and_args() {
        let spec = CommandSpec::new("perf").args(["record", "-g"]);
        assert_eq!(spec.to_string(), "perf record -g");
    }

    #[tokio::test]
    async fn output_goes_to_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("nested").join("out.log");
        let spec = sh("echo hello; echo oops >&2").log_to(&log);

        let mut p = ObservedProcess::spawn("echo", &spec).unwrap();
        let status = p.wait().await.unwrap();
        assert!(status.success());

        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("hello"));
        assert!(content.contains("oops"));
    }

    #[tokio::test]
    async fn env_is_passed_to_child() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("env.log");
        let mut spec = sh("echo \"display=$DISPLAY\"").log_to(&log);
        spec.env.push(("DISPLAY".to_string(), ":77".to_string()));

        let mut p = ObservedProcess::spawn("env", &spec).unwrap();
        p.wait().await.unwrap();
        assert!(std::fs::read_to_string(&log).unwrap().contains("display=:77"));
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let spec = CommandSpec::new("/nonexistent/peer-launcher-test-binary");
        let err = ObservedProcess::spawn("missing", &spec).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn terminate_sends_sigterm() {
        let mut p = ObservedProcess::spawn("sleeper", &CommandSpec::new("sleep").arg("30")).unwrap();
        assert!(p.is_alive());
        p.terminate().unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), p.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.signal(), Some(libc_sigterm()));
        assert!(!p.is_alive());
    }

    #[tokio::test]
    async fn terminate_after_exit_is_ok() {
        let mut p = ObservedProcess::spawn("true", &CommandSpec::new("true")).unwrap();
        p.wait().await.unwrap();
        p.terminate().unwrap();
        p.terminate().unwrap();
    }

    #[tokio::test]
    async fn exit_code_is_recorded() {
        let mut p = ObservedProcess::spawn("fail", &sh("exit 3")).unwrap();
        let status = p.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
        assert_eq!(p.exit_status().and_then(|s| s.code()), Some(3));
        // A second wait returns the recorded status.
        assert_eq!(p.wait().await.unwrap().code(), Some(3));
    }

    #[tokio::test]
    async fn force_kill_stops_process() {
        let mut p = ObservedProcess::spawn("sleeper", &CommandSpec::new("sleep").arg("30")).unwrap();
        p.force_kill().unwrap();
        let status = p.wait().await.unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
    }

    #[tokio::test]
    async fn run_step_redirects_stdout_and_captures_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let output = run_step(&sh("echo data; echo warn >&2; exit 2"), Some(&out))
            .await
            .unwrap();
        assert_eq!(output.status.code(), Some(2));
        assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "warn");
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "data");
        assert!(output.stdout.is_empty());
    }

    #[tokio::test]
    async fn run_step_captures_stdout_without_redirect() {
        let output = run_step(&sh("echo data"), None).await.unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "data");
    }

    #[test]
    fn tail_text_keeps_last_lines() {
        assert_eq!(tail_text(b"a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail_text(b"only", 5), "only");
        assert_eq!(tail_text(b"", 3), "");
    }

    fn libc_sigterm() -> i32 {
        Signal::SIGTERM as i32
    }
}
