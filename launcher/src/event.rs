use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Phase of a single launcher run.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LauncherState {
    /// Following the watched log for the arrival pattern.
    Waiting,
    /// The latch tripped and the downstream process has been started.
    Launched,
    /// The downstream process exited, failed to start, or the run was stopped.
    Done,
}

/// A watched-log line containing the arrival pattern.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub raw: String,
    pub matched: String,
    pub line_number: u64,
    pub observed_at: DateTime<Local>,
}

impl ConnectionEvent {
    /// Returns an event if `line` contains `pattern`.
    pub fn detect(line: &str, pattern: &str, line_number: u64) -> Option<Self> {
        if pattern.is_empty() || !line.contains(pattern) {
            return None;
        }
        Some(Self {
            raw: line.to_string(),
            matched: pattern.to_string(),
            line_number,
            observed_at: Local::now(),
        })
    }
}

/// One-shot trigger. Fires at most once no matter how many events follow.
#[derive(Debug, Default)]
pub struct Latch {
    tripped: bool,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the latch. Returns `true` only on the first call.
    pub fn trip(&mut self) -> bool {
        !std::mem::replace(&mut self.tripped, true)
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }
}

/// Resolves once shutdown has been requested or the sender is gone.
///
/// Cancel safe, so it can sit in any `select!` next to a suspension point.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
