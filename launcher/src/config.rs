use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths;
use crate::process::CommandSpec;

pub const DEFAULT_RUN_DIR: &str = "webrtc_run";
pub const DEFAULT_DISPLAY: &str = ":99";
pub const DEFAULT_SIGNALING_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_SIGNALING_PORT: u16 = 8888;
pub const DEFAULT_ARRIVAL_PATTERN: &str = "connected";
pub const DEFAULT_GRACE_SECS: u64 = 2;
pub const DEFAULT_LOG_WAIT_SECS: u64 = 5;
pub const DEFAULT_STARTUP_DELAY_SECS: u64 = 1;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
pub const DEFAULT_LIVENESS_INTERVAL_MS: u64 = 1000;
/// Name of the companion whose log is watched when `watch_log` is unset.
pub const SIGNALING_COMPANION: &str = "signaling";

/// Root configuration structure, deserialized from the `--config` TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
    /// Long-lived helpers started before watching begins. Replaces the
    /// built-in display + signaling pair when present.
    #[serde(default = "default_companions")]
    pub companions: Vec<CompanionConfig>,
    #[serde(default)]
    pub profiler: ProfilerConfig,
    #[serde(default)]
    pub log_report: LogReportConfig,
    #[serde(default)]
    pub video: VideoConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            signaling: SignalingConfig::default(),
            launcher: LauncherConfig::default(),
            companions: default_companions(),
            profiler: ProfilerConfig::default(),
            log_report: LogReportConfig::default(),
            video: VideoConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// Directory receiving every log, marker and status artifact of a run.
    #[serde(default = "default_run_dir")]
    pub run_dir: String,
    /// X display handed to children through `DISPLAY`.
    #[serde(default = "default_display")]
    pub display: String,
    /// Process-name substrings swept with SIGTERM during teardown.
    #[serde(default = "default_kill_patterns")]
    pub kill_patterns: Vec<String>,
    /// Only watched-log lines containing this substring are echoed to stdout.
    #[serde(default)]
    pub echo_filter: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            run_dir: default_run_dir(),
            display: default_display(),
            kill_patterns: default_kill_patterns(),
            echo_filter: None,
        }
    }
}

/// Rendezvous endpoint shared by the signaling server and the sender.
#[derive(Debug, Deserialize, Clone)]
pub struct SignalingConfig {
    #[serde(default = "default_signaling_address")]
    pub address: String,
    #[serde(default = "default_signaling_port")]
    pub port: u16,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            address: default_signaling_address(),
            port: DEFAULT_SIGNALING_PORT,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LauncherConfig {
    /// Fixed substring announcing a peer connection in the watched log.
    #[serde(default = "default_arrival_pattern")]
    pub arrival_pattern: String,
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    /// How long to wait for the watched log to appear.
    #[serde(default = "default_log_wait_secs")]
    pub log_wait_secs: u64,
    /// Companions must still be alive once this delay has passed.
    #[serde(default = "default_startup_delay_secs")]
    pub startup_delay_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,
    /// Explicit log to follow. Defaults to the signaling companion's log.
    #[serde(default)]
    pub watch_log: Option<String>,
    /// Configuration artifact handed to the sender via `{video_config}`.
    #[serde(default = "default_video_config")]
    pub video_config: String,
    #[serde(default = "default_downstream")]
    pub downstream: CommandConfig,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            arrival_pattern: default_arrival_pattern(),
            grace_secs: DEFAULT_GRACE_SECS,
            log_wait_secs: DEFAULT_LOG_WAIT_SECS,
            startup_delay_secs: DEFAULT_STARTUP_DELAY_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            liveness_interval_ms: DEFAULT_LIVENESS_INTERVAL_MS,
            watch_log: None,
            video_config: default_video_config(),
            downstream: default_downstream(),
        }
    }
}

impl LauncherConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn log_wait(&self) -> Duration {
        Duration::from_secs(self.log_wait_secs)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms.max(10))
    }
}

/// Executable path plus argument list; both may contain placeholders.
#[derive(Debug, Deserialize, Clone)]
pub struct CommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandConfig {
    /// Expands placeholders and attaches `log_path` and the `DISPLAY` variable.
    pub fn to_spec(&self, ph: &Placeholders, log_path: Option<PathBuf>) -> CommandSpec {
        let mut spec = CommandSpec::new(ph.expand(&self.program))
            .args(self.args.iter().map(|a| ph.expand(a)));
        spec.env.push(("DISPLAY".to_string(), ph.display.clone()));
        match log_path {
            Some(path) => spec.log_to(path),
            None => spec,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompanionConfig {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Output log; defaults to `<run_dir>/<name>.log`.
    #[serde(default)]
    pub log: Option<String>,
}

impl CompanionConfig {
    pub fn log_path(&self, ph: &Placeholders, run_dir: &Path) -> PathBuf {
        match &self.log {
            Some(p) => PathBuf::from(ph.expand(p)),
            None => paths::companion_log_path(run_dir, &self.name),
        }
    }

    pub fn to_spec(&self, ph: &Placeholders, run_dir: &Path) -> CommandSpec {
        let command = CommandConfig {
            program: self.program.clone(),
            args: self.args.clone(),
        };
        command.to_spec(ph, Some(self.log_path(ph, run_dir)))
    }
}

/// perf + FlameGraph capture of the downstream process.
#[derive(Debug, Deserialize, Clone)]
pub struct ProfilerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_perf")]
    pub perf: String,
    #[serde(default = "default_perl")]
    pub perl: String,
    /// Checkout of the FlameGraph toolkit (stackcollapse-perf.pl, flamegraph.pl).
    #[serde(default = "default_flamegraph_dir")]
    pub flamegraph_dir: String,
    /// Sampling frequency in Hz.
    #[serde(default = "default_frequency")]
    pub frequency: u32,
    #[serde(default = "default_title")]
    pub title: String,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            perf: default_perf(),
            perl: default_perl(),
            flamegraph_dir: default_flamegraph_dir(),
            frequency: default_frequency(),
            title: default_title(),
        }
    }
}

/// Flame graph and JSON summary derived from the sender's own log.
/// Rendering reuses `[profiler]`'s perl and FlameGraph checkout.
#[derive(Debug, Deserialize, Clone)]
pub struct LogReportConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_log_report_title")]
    pub title: String,
    #[serde(default = "default_log_report_width")]
    pub width: u32,
    #[serde(default = "default_log_report_height")]
    pub height: u32,
    /// FlameGraph palette name.
    #[serde(default = "default_log_report_colors")]
    pub colors: String,
}

impl Default for LogReportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            title: default_log_report_title(),
            width: default_log_report_width(),
            height: default_log_report_height(),
            colors: default_log_report_colors(),
        }
    }
}

/// Input description and encoder settings for the `video` role.
#[derive(Debug, Deserialize, Clone)]
pub struct VideoConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_video_input")]
    pub input: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_pix_fmt")]
    pub pix_fmt: String,
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default = "default_bitrate")]
    pub bitrate: String,
    #[serde(default = "default_video_output_dir")]
    pub output_dir: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            input: default_video_input(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            pix_fmt: default_pix_fmt(),
            codec: default_codec(),
            bitrate: default_bitrate(),
            output_dir: default_video_output_dir(),
        }
    }
}

/// Values substituted into `{name}` placeholders of programs, args and paths.
#[derive(Debug, Clone)]
pub struct Placeholders {
    pub display: String,
    pub address: String,
    pub port: u16,
    pub run_dir: String,
    pub video_config: String,
}

impl Placeholders {
    /// Replaces `{display}`, `{address}`, `{port}`, `{run_dir}`, `{video_config}`
    /// and `${VAR}` environment references. Unknown variables are left as-is.
    pub fn expand(&self, s: &str) -> String {
        let s = s
            .replace("{display}", &self.display)
            .replace("{address}", &self.address)
            .replace("{port}", &self.port.to_string())
            .replace("{run_dir}", &self.run_dir)
            .replace("{video_config}", &self.video_config);
        expand_env(&s)
    }
}

fn expand_env(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

impl Config {
    pub fn run_dir(&self) -> PathBuf {
        PathBuf::from(expand_env(&self.general.run_dir))
    }

    pub fn placeholders(&self) -> Placeholders {
        Placeholders {
            display: self.general.display.clone(),
            address: self.signaling.address.clone(),
            port: self.signaling.port,
            run_dir: self.run_dir().to_string_lossy().into_owned(),
            video_config: expand_env(&self.launcher.video_config),
        }
    }

    /// The log followed for the arrival pattern.
    pub fn watched_log_path(&self) -> Option<PathBuf> {
        let ph = self.placeholders();
        if let Some(p) = &self.launcher.watch_log {
            return Some(PathBuf::from(ph.expand(p)));
        }
        self.companions
            .iter()
            .find(|c| c.name == SIGNALING_COMPANION)
            .map(|c| c.log_path(&ph, &self.run_dir()))
    }

    /// Rejects configurations the launcher cannot act on.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.launcher.arrival_pattern.is_empty(),
            "launcher.arrival_pattern must not be empty"
        );
        ensure!(
            !self.launcher.downstream.program.trim().is_empty(),
            "launcher.downstream.program must not be empty"
        );
        let mut names = HashSet::new();
        for c in &self.companions {
            ensure!(!c.program.trim().is_empty(), "companion '{}' has no program", c.name);
            ensure!(names.insert(c.name.as_str()), "duplicate companion name '{}'", c.name);
        }
        ensure!(
            self.watched_log_path().is_some(),
            "no launcher.watch_log set and no '{SIGNALING_COMPANION}' companion to follow"
        );
        Ok(())
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn default_companions() -> Vec<CompanionConfig> {
    vec![
        CompanionConfig {
            name: "display".to_string(),
            program: "Xvfb".to_string(),
            args: vec![
                "{display}".to_string(),
                "-screen".to_string(),
                "0".to_string(),
                "1920x1080x24".to_string(),
            ],
            log: None,
        },
        CompanionConfig {
            name: SIGNALING_COMPANION.to_string(),
            program: "peerconnection_server".to_string(),
            args: vec!["--port={port}".to_string()],
            log: None,
        },
    ]
}

fn default_downstream() -> CommandConfig {
    CommandConfig {
        program: "peerconnection_client".to_string(),
        args: vec![
            "--server={address}".to_string(),
            "--port={port}".to_string(),
            "--autoconnect".to_string(),
            "--autocall".to_string(),
            "--video_config={video_config}".to_string(),
        ],
    }
}

fn default_run_dir() -> String {
    DEFAULT_RUN_DIR.to_string()
}

fn default_display() -> String {
    DEFAULT_DISPLAY.to_string()
}

fn default_kill_patterns() -> Vec<String> {
    vec!["peerconnection_client".to_string()]
}

fn default_signaling_address() -> String {
    DEFAULT_SIGNALING_ADDRESS.to_string()
}

fn default_signaling_port() -> u16 {
    DEFAULT_SIGNALING_PORT
}

fn default_arrival_pattern() -> String {
    DEFAULT_ARRIVAL_PATTERN.to_string()
}

fn default_grace_secs() -> u64 {
    DEFAULT_GRACE_SECS
}

fn default_log_wait_secs() -> u64 {
    DEFAULT_LOG_WAIT_SECS
}

fn default_startup_delay_secs() -> u64 {
    DEFAULT_STARTUP_DELAY_SECS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_liveness_interval_ms() -> u64 {
    DEFAULT_LIVENESS_INTERVAL_MS
}

fn default_video_config() -> String {
    "video_config.json".to_string()
}

fn default_true() -> bool {
    true
}

fn default_perf() -> String {
    "perf".to_string()
}

fn default_perl() -> String {
    "perl".to_string()
}

fn default_flamegraph_dir() -> String {
    "FlameGraph".to_string()
}

fn default_frequency() -> u32 {
    99
}

fn default_title() -> String {
    "WebRTC sender CPU flame graph".to_string()
}

fn default_log_report_title() -> String {
    "WebRTC transmission".to_string()
}

fn default_log_report_width() -> u32 {
    1200
}

fn default_log_report_height() -> u32 {
    800
}

fn default_log_report_colors() -> String {
    "hot".to_string()
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_video_input() -> String {
    "input.yuv".to_string()
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_fps() -> u32 {
    30
}

fn default_pix_fmt() -> String {
    "yuv420p".to_string()
}

fn default_codec() -> String {
    "libx264".to_string()
}

fn default_bitrate() -> String {
    "2M".to_string()
}

fn default_video_output_dir() -> String {
    "video".to_string()
}
