/// CPU flame graph of the downstream process.
///
/// Four external steps, each given an explicit argument list and each
/// checked for a non-empty output before the next one starts:
///   perf record  → <stem>.data
///   perf script  → <stem>.perf
///   stackcollapse-perf.pl → <stem>.folded
///   flamegraph.pl         → <stem>.svg
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ProfilerConfig;
use crate::paths::with_extension;
use crate::process::{run_step, tail_text, CommandSpec};

#[derive(Debug, Clone)]
pub struct Profiler {
    config: ProfilerConfig,
    duration: Duration,
    stem: PathBuf,
}

impl Profiler {
    /// `stem` is the extension-less path shared by all artifacts of this capture.
    pub fn new(config: ProfilerConfig, duration: Duration, stem: PathBuf) -> Self {
        Self {
            config,
            duration,
            stem,
        }
    }

    pub fn data_path(&self) -> PathBuf {
        with_extension(&self.stem, "data")
    }

    pub fn script_path(&self) -> PathBuf {
        with_extension(&self.stem, "perf")
    }

    pub fn folded_path(&self) -> PathBuf {
        with_extension(&self.stem, "folded")
    }

    pub fn svg_path(&self) -> PathBuf {
        with_extension(&self.stem, "svg")
    }

    fn tool(&self, script: &str) -> String {
        Path::new(&self.config.flamegraph_dir)
            .join(script)
            .to_string_lossy()
            .into_owned()
    }

    pub fn record_command(&self, pid: u32) -> CommandSpec {
        CommandSpec::new(&self.config.perf).args([
            "record".to_string(),
            "-F".to_string(),
            self.config.frequency.to_string(),
            "-g".to_string(),
            "-p".to_string(),
            pid.to_string(),
            "-o".to_string(),
            self.data_path().to_string_lossy().into_owned(),
            "--".to_string(),
            "sleep".to_string(),
            self.duration.as_secs().max(1).to_string(),
        ])
    }

    pub fn script_command(&self) -> CommandSpec {
        CommandSpec::new(&self.config.perf).args([
            "script".to_string(),
            "-i".to_string(),
            self.data_path().to_string_lossy().into_owned(),
        ])
    }

    pub fn collapse_command(&self) -> CommandSpec {
        CommandSpec::new(&self.config.perl).args([
            self.tool("stackcollapse-perf.pl"),
            self.script_path().to_string_lossy().into_owned(),
        ])
    }

    pub fn render_command(&self) -> CommandSpec {
        CommandSpec::new(&self.config.perl).args([
            self.tool("flamegraph.pl"),
            "--title".to_string(),
            self.config.title.clone(),
            self.folded_path().to_string_lossy().into_owned(),
        ])
    }

    /// Samples `pid` for the configured duration (or until it exits) and
    /// renders the SVG. Returns the SVG path.
    pub async fn capture(self, pid: u32) -> Result<PathBuf> {
        tracing::info!(pid, secs = self.duration.as_secs(), "profiling downstream process");

        step("perf record", &self.record_command(pid), None).await?;
        ensure_non_empty(&self.data_path())?;

        step("perf script", &self.script_command(), Some(&self.script_path())).await?;
        ensure_non_empty(&self.script_path())?;

        step("stackcollapse", &self.collapse_command(), Some(&self.folded_path())).await?;
        ensure_non_empty(&self.folded_path())?;

        step("flamegraph", &self.render_command(), Some(&self.svg_path())).await?;
        ensure_non_empty(&self.svg_path())?;

        let svg = self.svg_path();
        tracing::info!(path = %svg.display(), "flame graph written");
        Ok(svg)
    }
}

pub(crate) async fn step(label: &str, spec: &CommandSpec, stdout_to: Option<&Path>) -> Result<()> {
    let output = run_step(spec, stdout_to)
        .await
        .with_context(|| format!("{label}: failed to run `{spec}`"))?;
    if !output.status.success() {
        bail!(
            "{label} exited with {}: {}",
            output.status,
            tail_text(&output.stderr, 5)
        );
    }
    Ok(())
}

pub(crate) fn ensure_non_empty(path: &Path) -> Result<()> {
    let len = std::fs::metadata(path)
        .with_context(|| format!("expected output {} is missing", path.display()))?
        .len();
    if len == 0 {
        bail!("output {} is empty", path.display());
    }
    Ok(())
}
