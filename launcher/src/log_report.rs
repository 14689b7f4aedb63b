/// Flame graph and per-category summary derived from a WebRTC log.
///
/// Recognised log lines become timed events. Events are folded into
/// `Category;Component;Function weight` stacks for flamegraph.pl and
/// summarised per category into a JSON report:
///   <stem>.folded  folded stacks
///   <stem>.svg     flamegraph.pl rendering (best effort)
///   <stem>.json    event counts and timings per category
use anyhow::{Context, Result};
use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{LogReportConfig, ProfilerConfig};
use crate::flamegraph::{ensure_non_empty, step};
use crate::paths::with_extension;
use crate::process::CommandSpec;

/// Lines without a time of their own are placed at `line * LINE_TIME_STEP`.
const LINE_TIME_STEP: u64 = 100;
/// Frame processing weight per reported frame per second.
const FPS_WEIGHT: u64 = 10;
const DECISION_WEIGHT: u64 = 5;
const BWE_WEIGHT: u64 = 3;
/// Function names that mark a media-path call worth counting.
const RTP_KEYWORDS: [&str; 4] = ["Receive", "Process", "Decode", "Render"];

/// One recognised event with its weight in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedEvent {
    pub timestamp: u64,
    /// Dot-separated path such as `GCC.DecisionSnapshot`.
    pub function: String,
    pub duration_ms: u64,
}

impl TimedEvent {
    fn new(timestamp: u64, function: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            timestamp,
            function: function.into(),
            duration_ms,
        }
    }

    /// First segment of the function path.
    pub fn category(&self) -> &str {
        self.function
            .split_once('.')
            .map_or(self.function.as_str(), |(category, _)| category)
    }
}

/// Compiled recognisers for the log lines that carry timing information.
pub struct LogPatterns {
    video_quality: Regex,
    fps: Regex,
    decode_ms: Regex,
    gcc_decision: Regex,
    bwe: Regex,
    rtp_call: Regex,
    thread_timing: Regex,
}

impl LogPatterns {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            video_quality: Regex::new(r"\[VideoQuality-([^\]]+)\] Time: (\d+), SSRC: (\d+), (.+)")?,
            fps: Regex::new(r"FPS: (\d+)")?,
            decode_ms: Regex::new(r"decode_ms: (\d+)")?,
            gcc_decision: Regex::new(r"\[GCC-DECISION-SNAPSHOT\] at (\d+)ms \| (.+)")?,
            bwe: Regex::new(r"\[([^-]+BWE-[^\]]+)\] Time: (\d+) ms, (.+)")?,
            rtp_call: Regex::new(r"\(([^)]+)\): (\w+): (.+)")?,
            thread_timing: Regex::new(r"\(thread\.cc:\d+\): Message to Thread .+ took (\d+)ms")?,
        })
    }

    /// Appends every event found on `line`. One line may yield several.
    pub fn scan(&self, line: &str, line_number: u64, events: &mut Vec<TimedEvent>) {
        let positional = line_number.saturating_mul(LINE_TIME_STEP);

        if let Some(caps) = self.video_quality.captures(line) {
            if let Some(ts) = number(&caps, 2) {
                let kind = &caps[1];
                let details = &caps[4];
                if let Some(fps) = first_number(&self.fps, details) {
                    events.push(TimedEvent::new(
                        ts,
                        format!("VideoQuality.{kind}.ProcessFrame"),
                        fps.saturating_mul(FPS_WEIGHT),
                    ));
                }
                if let Some(ms) = first_number(&self.decode_ms, details).filter(|&ms| ms > 0) {
                    events.push(TimedEvent::new(ts, format!("VideoQuality.{kind}.Decode"), ms));
                }
            }
        }

        if let Some(ts) = self.gcc_decision.captures(line).and_then(|c| number(&c, 1)) {
            events.push(TimedEvent::new(ts, "GCC.DecisionSnapshot", DECISION_WEIGHT));
        }

        if let Some(caps) = self.bwe.captures(line) {
            if let Some(ts) = number(&caps, 2) {
                events.push(TimedEvent::new(ts, format!("GCC.{}", &caps[1]), BWE_WEIGHT));
            }
        }

        if let Some(caps) = self.rtp_call.captures(line) {
            let function = &caps[2];
            if RTP_KEYWORDS.iter().any(|k| function.contains(k)) {
                events.push(TimedEvent::new(positional, format!("RTP.{function}"), 1));
            }
        }

        if let Some(ms) = first_number(&self.thread_timing, line) {
            events.push(TimedEvent::new(positional, "Threading.MessageDispatch", ms));
        }
    }

    /// Scans a whole log. Lines are numbered from 1; blank lines are skipped.
    pub fn scan_text(&self, text: &str) -> Vec<TimedEvent> {
        let mut events = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            self.scan(line, index as u64 + 1, &mut events);
        }
        events
    }
}

fn number(caps: &Captures<'_>, group: usize) -> Option<u64> {
    caps.get(group)?.as_str().parse().ok()
}

fn first_number(re: &Regex, text: &str) -> Option<u64> {
    number(&re.captures(text)?, 1)
}

/// Folded stacks, one per distinct function, weighted by total duration.
/// Single-segment names are placed under a `WebRTC` root.
pub fn fold_stacks(events: &[TimedEvent]) -> Vec<String> {
    let mut totals: BTreeMap<&str, u64> = BTreeMap::new();
    for event in events {
        let total = totals.entry(event.function.as_str()).or_default();
        *total = total.saturating_add(event.duration_ms);
    }
    totals
        .into_iter()
        .map(|(function, total)| {
            if function.contains('.') {
                format!("{} {total}", function.replace('.', ";"))
            } else {
                format!("WebRTC;{function} {total}")
            }
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct PerformanceReport {
    pub summary: ReportSummary,
    pub categories: BTreeMap<String, CategoryStats>,
}

#[derive(Debug, Serialize)]
pub struct ReportSummary {
    pub total_events: usize,
    pub total_time_ms: u64,
    pub analysis_timestamp: String,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct CategoryStats {
    pub event_count: u64,
    pub total_time_ms: u64,
    /// Rounded to two decimals.
    pub average_time_ms: f64,
    pub max_time_ms: u64,
}

pub fn summarize(events: &[TimedEvent]) -> PerformanceReport {
    let mut categories: BTreeMap<String, CategoryStats> = BTreeMap::new();
    for event in events {
        let stats = categories.entry(event.category().to_string()).or_default();
        stats.event_count += 1;
        stats.total_time_ms = stats.total_time_ms.saturating_add(event.duration_ms);
        stats.max_time_ms = stats.max_time_ms.max(event.duration_ms);
    }
    for stats in categories.values_mut() {
        let average = stats.total_time_ms as f64 / stats.event_count as f64;
        stats.average_time_ms = (average * 100.0).round() / 100.0;
    }

    PerformanceReport {
        summary: ReportSummary {
            total_events: events.len(),
            total_time_ms: events
                .iter()
                .fold(0u64, |sum, e| sum.saturating_add(e.duration_ms)),
            analysis_timestamp: chrono::Local::now().to_rfc3339(),
        },
        categories,
    }
}

/// Where a finished report landed.
#[derive(Debug)]
pub struct ReportArtifacts {
    pub folded: PathBuf,
    /// `None` when flamegraph.pl failed; the other artifacts are still valid.
    pub svg: Option<PathBuf>,
    pub report: PathBuf,
    pub events: usize,
}

pub struct LogReport {
    config: LogReportConfig,
    perl: String,
    flamegraph_dir: String,
    stem: PathBuf,
    patterns: LogPatterns,
}

impl LogReport {
    /// Rendering uses the perl binary and FlameGraph checkout of `profiler`.
    pub fn new(config: LogReportConfig, profiler: &ProfilerConfig, stem: PathBuf) -> Result<Self> {
        Ok(Self {
            config,
            perl: profiler.perl.clone(),
            flamegraph_dir: profiler.flamegraph_dir.clone(),
            stem,
            patterns: LogPatterns::new().context("compiling log patterns")?,
        })
    }

    pub fn folded_path(&self) -> PathBuf {
        with_extension(&self.stem, "folded")
    }

    pub fn svg_path(&self) -> PathBuf {
        with_extension(&self.stem, "svg")
    }

    pub fn report_path(&self) -> PathBuf {
        with_extension(&self.stem, "json")
    }

    pub fn render_command(&self, source_log: &Path) -> CommandSpec {
        let source = source_log
            .file_name()
            .map_or_else(|| source_log.to_string_lossy(), |n| n.to_string_lossy());
        CommandSpec::new(&self.perl).args([
            Path::new(&self.flamegraph_dir)
                .join("flamegraph.pl")
                .to_string_lossy()
                .into_owned(),
            "--title".to_string(),
            self.config.title.clone(),
            "--subtitle".to_string(),
            format!("log: {source}"),
            "--width".to_string(),
            self.config.width.to_string(),
            "--height".to_string(),
            self.config.height.to_string(),
            "--colors".to_string(),
            self.config.colors.clone(),
            self.folded_path().to_string_lossy().into_owned(),
        ])
    }

    /// Writes the folded stacks and the JSON summary for `log`, then renders
    /// the SVG. Returns `None` when the log holds no recognised events.
    pub async fn generate(&self, log: &Path) -> Result<Option<ReportArtifacts>> {
        let bytes = tokio::fs::read(log)
            .await
            .with_context(|| format!("cannot read {}", log.display()))?;
        let events = self.patterns.scan_text(&String::from_utf8_lossy(&bytes));
        if events.is_empty() {
            tracing::info!(log = %log.display(), "no timing events found; skipping log report");
            return Ok(None);
        }
        tracing::info!(log = %log.display(), events = events.len(), "building log report");

        let folded = self.folded_path();
        let mut stacks = fold_stacks(&events).join("\n");
        stacks.push('\n');
        tokio::fs::write(&folded, stacks)
            .await
            .with_context(|| format!("cannot write {}", folded.display()))?;

        let report = self.report_path();
        let json = serde_json::to_string_pretty(&summarize(&events))
            .context("serializing performance report")?;
        tokio::fs::write(&report, json)
            .await
            .with_context(|| format!("cannot write {}", report.display()))?;

        let svg = match self.render(log).await {
            Ok(()) => Some(self.svg_path()),
            Err(e) => {
                tracing::warn!("log flame graph rendering failed: {e:#}");
                None
            }
        };

        Ok(Some(ReportArtifacts {
            folded,
            svg,
            report,
            events: events.len(),
        }))
    }

    async fn render(&self, log: &Path) -> Result<()> {
        let svg = self.svg_path();
        step("flamegraph", &self.render_command(log), Some(&svg)).await?;
        ensure_non_empty(&svg)
    }
}
