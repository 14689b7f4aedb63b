/// Canonical artifact paths inside a run directory.
///
/// Every file the launcher writes lives under a single run directory:
///   - status.toml         Run status, rewritten at every transition.
///   - connected.flag      Latch marker, removed again during teardown.
///   - <companion>.log     Output of each companion process.
///   - sender_<ts>.log     Output of the downstream process.
///   - flamegraph_<ts>.*   Profiler artifacts (.data, .perf, .folded, .svg).
///   - webrtc_<ts>.*       Log report artifacts (.folded, .svg, .json).
use std::path::{Path, PathBuf};

pub const STATUS_FILE_NAME: &str = "status.toml";
pub const MARKER_FILE_NAME: &str = "connected.flag";
const DOWNSTREAM_LOG_PREFIX: &str = "sender";
const PROFILE_PREFIX: &str = "flamegraph";
const LOG_REPORT_PREFIX: &str = "webrtc";

/// Returns the current local time formatted as `YYYY-MM-DD_HH-MM-SS`.
pub fn local_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// Replaces characters that are awkward in file names with `_`.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

pub fn status_file_path(run_dir: &Path) -> PathBuf {
    run_dir.join(STATUS_FILE_NAME)
}

pub fn marker_file_path(run_dir: &Path) -> PathBuf {
    run_dir.join(MARKER_FILE_NAME)
}

/// `<run_dir>/<name>.log` for a companion process.
pub fn companion_log_path(run_dir: &Path, name: &str) -> PathBuf {
    run_dir.join(format!("{}.log", sanitize_component(name)))
}

/// `<run_dir>/sender_<timestamp>.log`
pub fn downstream_log_path(run_dir: &Path, timestamp: &str) -> PathBuf {
    run_dir.join(format!("{DOWNSTREAM_LOG_PREFIX}_{timestamp}.log"))
}

/// Newest `sender_<timestamp>.log` in `run_dir`. Timestamps sort lexically.
pub fn latest_downstream_log(run_dir: &Path) -> Option<PathBuf> {
    let prefix = format!("{DOWNSTREAM_LOG_PREFIX}_");
    std::fs::read_dir(run_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".log"))
        })
        .max()
}

/// Extension-less stem shared by all profiler artifacts of one run.
pub fn profile_stem(run_dir: &Path, timestamp: &str) -> PathBuf {
    run_dir.join(format!("{PROFILE_PREFIX}_{timestamp}"))
}

/// Extension-less stem of the report derived from the sender's log.
pub fn log_report_stem(run_dir: &Path, timestamp: &str) -> PathBuf {
    run_dir.join(format!("{LOG_REPORT_PREFIX}_{timestamp}"))
}

/// Appends `.ext` to `stem` without touching dots already in the file name.
pub fn with_extension(stem: &Path, ext: &str) -> PathBuf {
    let mut os = stem.as_os_str().to_os_string();
    os.push(".");
    os.push(ext);
    PathBuf::from(os)
}
