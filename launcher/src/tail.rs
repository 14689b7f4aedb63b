use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

use crate::error::RunError;
use crate::event::shutdown_requested;

/// One complete line read from the followed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailLine {
    /// 1-based line number since the file was opened (or last truncated).
    pub number: u64,
    pub text: String,
}

/// Follows a growing, append-only text file line by line.
///
/// Reaching the current end of the file is not end-of-stream: the follower
/// suspends until the file grows again, woken by a filesystem watcher with a
/// fixed poll interval as fallback. The sequence ends only when shutdown is
/// requested (or the shutdown sender is dropped).
pub struct LogTail {
    path: PathBuf,
    reader: BufReader<File>,
    /// Bytes of a line whose newline has not been written yet.
    pending: Vec<u8>,
    /// Bytes of the lines already returned.
    consumed: u64,
    line_number: u64,
    poll_interval: Duration,
    wake_rx: mpsc::Receiver<()>,
    _watcher: Option<RecommendedWatcher>,
    shutdown: watch::Receiver<bool>,
}

impl LogTail {
    /// Opens `path`, waiting up to `wait` for it to appear.
    ///
    /// Fails with `RunError::Setup` if the file never shows up or cannot be
    /// opened, and with `RunError::Interrupted` if shutdown arrives first.
    pub async fn open(
        path: &Path,
        wait: Duration,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Self, RunError> {
        let deadline = Instant::now() + wait;
        while !path.exists() {
            if Instant::now() >= deadline {
                return Err(RunError::Setup(format!(
                    "log file {} did not appear within {}s",
                    path.display(),
                    wait.as_secs_f32()
                )));
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown_requested(&mut shutdown) => return Err(RunError::Interrupted),
            }
        }

        let file = File::open(path)
            .await
            .map_err(|e| RunError::Setup(format!("cannot open log file {}: {e}", path.display())))?;

        let (wake_tx, wake_rx) = mpsc::channel(1);
        let watcher = spawn_watcher(path, wake_tx);

        tracing::info!(path = %path.display(), "following log");
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            pending: Vec::new(),
            consumed: 0,
            line_number: 0,
            poll_interval,
            wake_rx,
            _watcher: watcher,
            shutdown,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines returned so far.
    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    /// Bytes read from the current file, including a buffered partial line.
    fn position(&self) -> u64 {
        self.consumed + self.pending.len() as u64
    }

    /// Returns the next complete line, suspending until one is written.
    /// `Ok(None)` means shutdown was requested.
    ///
    /// Cancel safe: bytes read before cancellation stay buffered and are
    /// returned by the next call.
    pub async fn next_line(&mut self) -> io::Result<Option<TailLine>> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(None);
            }

            // A cancelled read leaves its bytes in `pending`, so the position
            // is derived from the buffer rather than from `n`.
            let n = self.reader.read_until(b'\n', &mut self.pending).await?;

            if self.pending.last() == Some(&b'\n') {
                let raw = std::mem::take(&mut self.pending);
                self.consumed += raw.len() as u64;
                let text = String::from_utf8_lossy(&raw)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                self.line_number += 1;
                return Ok(Some(TailLine {
                    number: self.line_number,
                    text,
                }));
            }
            if n > 0 {
                // Partial line at the current end of file; keep reading.
                continue;
            }

            self.reopen_if_truncated().await?;

            tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => return Ok(None),
                Some(_) = self.wake_rx.recv() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Starts over from the beginning if the file shrank below what was read.
    async fn reopen_if_truncated(&mut self) -> io::Result<()> {
        let len = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            // Briefly missing during a rotate; keep the current handle.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if len < self.position() {
            tracing::warn!(path = %self.path.display(), "log truncated; reading from the start");
            let file = File::open(&self.path).await?;
            self.reader = BufReader::new(file);
            self.pending.clear();
            self.consumed = 0;
            self.line_number = 0;
        }
        Ok(())
    }
}

/// Watches the parent directory of `path` and pokes `wake_tx` whenever the
/// file changes. Returns `None` (poll-only mode) if no watcher can be set up.
fn spawn_watcher(path: &Path, wake_tx: mpsc::Sender<()>) -> Option<RecommendedWatcher> {
    let file_name = path.file_name()?.to_os_string();
    let watch_dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(file_name.as_os_str()));
                if ours {
                    // A full channel already holds a pending wakeup.
                    let _ = wake_tx.try_send(());
                }
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!("Failed to create file watcher, polling only: {e}");
            return None;
        }
    };

    // Watch the directory rather than the file so a recreated file is still seen.
    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        tracing::warn!("Failed to watch {}, polling only: {e}", watch_dir.display());
        return None;
    }
    Some(watcher)
}

/// Reads the last `n` lines of a finished log, for failure reports.
pub fn last_lines(path: &Path, n: usize) -> Vec<String> {
    let Ok(bytes) = std::fs::read(path) else {
        return Vec::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let mut lines: VecDeque<String> = VecDeque::with_capacity(n);
    for line in text.lines() {
        if lines.len() == n {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }
    lines.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const POLL: Duration = Duration::from_millis(50);

    fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    async fn next(tail: &mut LogTail) -> Option<TailLine> {
        tokio::time::timeout(Duration::from_secs(5), tail.next_line())
            .await
            .expect("timed out waiting for a line")
            .unwrap()
    }

    // ── open ──────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn missing_file_is_setup_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = watch::channel(false);
        let err = LogTail::open(&dir.path().join("absent.log"), Duration::ZERO, POLL, rx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RunError::Setup(_)));
    }

    #[tokio::test]
    async fn waits_for_file_to_appear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.log");
        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            append(&writer_path, "hello\n");
        });

        let (_tx, rx) = watch::channel(false);
        let mut tail = LogTail::open(&path, Duration::from_secs(5), POLL, rx).await.unwrap();
        assert_eq!(next(&mut tail).await.unwrap().text, "hello");
    }

    #[tokio::test]
    async fn shutdown_interrupts_open() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
        });
        let err = LogTail::open(&dir.path().join("never.log"), Duration::from_secs(30), POLL, rx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RunError::Interrupted));
    }

    // ── next_line ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn reads_existing_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        append(&path, "ping\nmember added: X\r\n");

        let (_tx, rx) = watch::channel(false);
        let mut tail = LogTail::open(&path, Duration::ZERO, POLL, rx).await.unwrap();
        assert_eq!(
            next(&mut tail).await.unwrap(),
            TailLine { number: 1, text: "ping".to_string() }
        );
        assert_eq!(
            next(&mut tail).await.unwrap(),
            TailLine { number: 2, text: "member added: X".to_string() }
        );
        assert_eq!(tail.line_number(), 2);
    }

    #[tokio::test]
    async fn follows_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        append(&path, "");

        let (_tx, rx) = watch::channel(false);
        let mut tail = LogTail::open(&path, Duration::ZERO, POLL, rx).await.unwrap();

        let writer_path = path.clone();
        tokio::spawn(async move {
            for i in 0..3 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                append(&writer_path, &format!("line {i}\n"));
            }
        });

        for i in 0..3 {
            assert_eq!(next(&mut tail).await.unwrap().text, format!("line {i}"));
        }
    }

    #[tokio::test]
    async fn partial_line_waits_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        append(&path, "member ");

        let (_tx, rx) = watch::channel(false);
        let mut tail = LogTail::open(&path, Duration::ZERO, POLL, rx).await.unwrap();

        let early = tokio::time::timeout(Duration::from_millis(200), tail.next_line()).await;
        assert!(early.is_err(), "partial line must not be returned");

        append(&path, "added\n");
        assert_eq!(next(&mut tail).await.unwrap().text, "member added");
    }

    #[tokio::test]
    async fn cancelled_read_keeps_partial_bytes_counted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        append(&path, "abcdef");

        let (_tx, rx) = watch::channel(false);
        let mut tail = LogTail::open(&path, Duration::ZERO, POLL, rx).await.unwrap();
        for _ in 0..3 {
            let early = tokio::time::timeout(Duration::from_millis(30), tail.next_line()).await;
            assert!(early.is_err());
        }
        assert_eq!(tail.position(), 6);

        // Shorter than the buffered partial line, so only a truncation check
        // that counts the buffer notices it.
        std::fs::write(&path, "xy\n").unwrap();
        let line = next(&mut tail).await.unwrap();
        assert_eq!(line, TailLine { number: 1, text: "xy".to_string() });
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        std::fs::write(&path, b"bad \xff byte\n").unwrap();

        let (_tx, rx) = watch::channel(false);
        let mut tail = LogTail::open(&path, Duration::ZERO, POLL, rx).await.unwrap();
        assert_eq!(next(&mut tail).await.unwrap().text, "bad \u{fffd} byte");
    }

    #[tokio::test]
    async fn shutdown_ends_the_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quiet.log");
        append(&path, "");

        let (tx, rx) = watch::channel(false);
        let mut tail = LogTail::open(&path, Duration::ZERO, POLL, rx).await.unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
        });
        assert!(next(&mut tail).await.is_none());
        // Stays closed.
        assert!(next(&mut tail).await.is_none());
    }

    #[tokio::test]
    async fn truncation_restarts_from_beginning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotating.log");
        append(&path, "a fairly long first line\n");

        let (_tx, rx) = watch::channel(false);
        let mut tail = LogTail::open(&path, Duration::ZERO, POLL, rx).await.unwrap();
        assert_eq!(next(&mut tail).await.unwrap().text, "a fairly long first line");

        std::fs::write(&path, "fresh\n").unwrap();
        let line = next(&mut tail).await.unwrap();
        assert_eq!(line, TailLine { number: 1, text: "fresh".to_string() });
    }

    // ── last_lines ────────────────────────────────────────────────────────────

    #[test]
    fn last_lines_keeps_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.log");
        std::fs::write(&path, "1\n2\n3\n4\n").unwrap();
        assert_eq!(last_lines(&path, 2), ["3", "4"]);
        assert_eq!(last_lines(&path, 10).len(), 4);
        assert!(last_lines(&dir.path().join("missing"), 3).is_empty());
    }
}
