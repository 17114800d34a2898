//! Log source tailing
//!
//! [`LogTailer`] keeps an open handle on the source so lines written to a
//! rotated file are still drained before the replacement is picked up. The
//! file identity (device, inode) detects renames, a shrinking length detects
//! truncation. Only complete lines are emitted; a trailing fragment waits for
//! its newline.

use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs::{File, Metadata};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::models::{LogRecord, SourceHealth};

pub struct LogTailer {
    source_id: String,
    path: PathBuf,
    file: Option<File>,
    identity: Option<(u64, u64)>,
    position: u64,
    partial: Vec<u8>,
    /// Bytes of the current line were dropped past [`MAX_LINE_BYTES`]
    truncated: bool,
    /// The last read stopped at [`MAX_BATCH_LINES`] with data left
    backlog: bool,
    seek_to_end: bool,
}

/// Records returned by one poll; the rest waits for the next
pub const MAX_BATCH_LINES: usize = 1024;

/// Longest line kept; the remainder up to the newline is discarded
pub const MAX_LINE_BYTES: usize = 64 * 1024;

impl LogTailer {
    /// Without `backfill` the first open starts at the end of the file.
    /// Files opened later (after rotation, or a source that did not exist
    /// yet) are always read from the start.
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>, backfill: bool) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
            file: None,
            identity: None,
            position: 0,
            partial: Vec::new(),
            truncated: false,
            backlog: false,
            seek_to_end: !backfill,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// More complete lines are waiting than the last poll returned
    pub fn has_backlog(&self) -> bool {
        self.backlog
    }

    /// Read the complete lines appended since the last poll, at most
    /// [`MAX_BATCH_LINES`] of them
    pub fn poll(&mut self) -> io::Result<Vec<LogRecord>> {
        let mut records = Vec::new();

        if self.file.is_none() {
            self.open()?;
        }

        match std::fs::metadata(&self.path) {
            Ok(meta) if Some(identity(&meta)) != self.identity => {
                match self.read_available(&mut records) {
                    Ok(()) if self.backlog => return Ok(records),
                    Ok(()) => {}
                    Err(e) => debug!(
                        "Cannot drain rotated {}: {}",
                        self.path.display(),
                        e
                    ),
                }
                self.flush_partial(&mut records);
                info!(
                    "Log source {} was rotated, reopening {}",
                    self.source_id,
                    self.path.display()
                );
                self.file = None;
                if let Err(e) = self.open() {
                    if records.is_empty() {
                        return Err(e);
                    }
                    // Hand over what the old file held; the reopen is
                    // retried on the next poll
                    warn!(
                        "Cannot reopen {} after rotation: {}",
                        self.path.display(),
                        e
                    );
                    return Ok(records);
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(
                    "{} moved away, draining old handle until it is recreated",
                    self.path.display()
                );
            }
            Err(e) => return Err(e),
        }

        if let Some(file) = &self.file {
            let len = file.metadata()?.len();
            if len < self.position {
                info!(
                    "Log source {} was truncated, restarting from the beginning",
                    self.source_id
                );
                self.position = 0;
                self.partial.clear();
                self.truncated = false;
            }
        }

        if let Err(e) = self.read_available(&mut records) {
            if records.is_empty() {
                return Err(e);
            }
            debug!("Read of {} failed after rotation: {}", self.path.display(), e);
        }
        Ok(records)
    }

    fn open(&mut self) -> io::Result<()> {
        let at_end = std::mem::replace(&mut self.seek_to_end, false);

        let file = File::open(&self.path)?;
        let meta = file.metadata()?;

        self.identity = Some(identity(&meta));
        self.position = if at_end { meta.len() } else { 0 };
        self.partial.clear();
        self.truncated = false;
        self.file = Some(file);

        debug!(
            "Opened {} at offset {} for {}",
            self.path.display(),
            self.position,
            self.source_id
        );
        Ok(())
    }

    fn read_available(&mut self, records: &mut Vec<LogRecord>) -> io::Result<()> {
        self.backlog = false;
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        file.seek(SeekFrom::Start(self.position))?;
        let mut reader = BufReader::new(file);
        let emitted_before = records.len();

        loop {
            if records.len() - emitted_before >= MAX_BATCH_LINES {
                self.backlog = true;
                break;
            }

            let available = match reader.fill_buf() {
                Ok(buf) => buf,
                // Keep what was read; the error resurfaces on the next poll
                Err(e) if records.len() > emitted_before => {
                    debug!("Read of {} interrupted: {}", self.path.display(), e);
                    break;
                }
                Err(e) => return Err(e),
            };
            if available.is_empty() {
                break;
            }

            let newline = available.iter().position(|b| *b == b'\n');
            let take = newline.map_or(available.len(), |i| i + 1);
            if push_capped(&mut self.partial, &available[..take]) {
                self.truncated = true;
            }
            reader.consume(take);
            self.position += take as u64;

            if newline.is_some() {
                if std::mem::take(&mut self.truncated) {
                    warn!(
                        "Line in {} exceeds {} bytes, truncated",
                        self.path.display(),
                        MAX_LINE_BYTES
                    );
                }
                let line = std::mem::take(&mut self.partial);
                if let Some(record) = make_record(&self.source_id, &line) {
                    records.push(record);
                }
            }
        }

        Ok(())
    }

    /// A rotated file will not grow again, so its last fragment is final
    fn flush_partial(&mut self, records: &mut Vec<LogRecord>) {
        self.truncated = false;
        let line = std::mem::take(&mut self.partial);
        if let Some(record) = make_record(&self.source_id, &line) {
            records.push(record);
        }
    }
}

/// Append up to [`MAX_LINE_BYTES`] in total. Returns true when bytes were
/// dropped.
fn push_capped(partial: &mut Vec<u8>, bytes: &[u8]) -> bool {
    let room = MAX_LINE_BYTES.saturating_sub(partial.len());
    let kept = bytes.len().min(room);
    partial.extend_from_slice(&bytes[..kept]);
    kept < bytes.len()
}

fn identity(meta: &Metadata) -> (u64, u64) {
    (meta.dev(), meta.ino())
}

fn make_record(source_id: &str, line: &[u8]) -> Option<LogRecord> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim_end_matches(['\n', '\r']);
    if text.is_empty() {
        return None;
    }
    Some(LogRecord::new(source_id, text))
}

/// Timing knobs for [`run_tailer`]
#[derive(Debug, Clone, Copy)]
pub struct TailOptions {
    pub poll_interval: Duration,
    pub degraded_after: u32,
    pub backoff_max: Duration,
}

/// Drive a tailer until shutdown, forwarding batches of records.
///
/// Wakes on filesystem events for the source's directory and on a periodic
/// poll. Read errors back off exponentially and are published through
/// `health`; after `degraded_after` consecutive failures the source is
/// reported DEGRADED but retries continue.
pub async fn run_tailer(
    mut tailer: LogTailer,
    opts: TailOptions,
    tx: mpsc::Sender<Vec<LogRecord>>,
    health: watch::Sender<SourceHealth>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (_watcher, mut wake_rx) = match watch_parent(tailer.path()) {
        Ok((watcher, rx)) => (Some(watcher), Some(rx)),
        Err(e) => {
            warn!(
                "Cannot watch {} ({}), falling back to polling",
                tailer.path().display(),
                e
            );
            (None, None)
        }
    };

    let mut backoff = Backoff::new(opts.poll_interval, opts.backoff_max);
    let mut delay = Duration::ZERO;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,
            Some(()) = wake(&mut wake_rx) => {}
            _ = tokio::time::sleep(delay) => {}
        }

        if *shutdown.borrow() {
            break;
        }

        match tailer.poll() {
            Ok(records) => {
                if backoff.failures() > 0 {
                    info!("Log source {} is readable again", tailer.source_id);
                }
                backoff.reset();
                delay = if tailer.has_backlog() {
                    Duration::ZERO
                } else {
                    opts.poll_interval
                };
                health.send_if_modified(|h| {
                    let changed = *h != SourceHealth::Healthy;
                    *h = SourceHealth::Healthy;
                    changed
                });

                if !records.is_empty() && tx.send(records).await.is_err() {
                    debug!("Consumer of {} is gone, stopping tailer", tailer.source_id);
                    break;
                }
            }
            Err(e) => {
                delay = backoff.next_delay();
                let failures = backoff.failures();

                let state = if failures >= opts.degraded_after {
                    if failures == opts.degraded_after {
                        error!(
                            "Log source {} is DEGRADED after {} failures: {}",
                            tailer.source_id, failures, e
                        );
                    }
                    SourceHealth::Degraded {
                        failures,
                        last_error: e.to_string(),
                    }
                } else {
                    warn!(
                        "Cannot read {} ({}), retrying in {:?}",
                        tailer.path().display(),
                        e,
                        delay
                    );
                    SourceHealth::Retrying { failures }
                };
                health.send_replace(state);
            }
        }
    }

    debug!("Tailer for {} stopped", tailer.source_id);
}

async fn wake(rx: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Watch the parent directory so creation after rotation is noticed too
fn watch_parent(path: &Path) -> notify::Result<(RecommendedWatcher, mpsc::Receiver<()>)> {
    let (tx, rx) = mpsc::channel(1);
    let file_name = path.file_name().map(|n| n.to_os_string());

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if ours {
                    // Full channel means a wake-up is already pending
                    let _ = tx.try_send(());
                }
            }
        },
        NotifyConfig::default(),
    )?;

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    watcher.watch(parent, RecursiveMode::NonRecursive)?;

    Ok((watcher, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn append(path: &Path, text: &[u8]) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text).unwrap();
    }

    fn lines(records: Vec<LogRecord>) -> Vec<String> {
        records.into_iter().map(|r| r.raw_line).collect()
    }

    #[test]
    fn test_starts_at_end_without_backfill() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, b"old line\n");

        let mut tailer = LogTailer::new("sshd", &path, false);
        assert!(tailer.poll().unwrap().is_empty());

        append(&path, b"new line\n");
        assert_eq!(lines(tailer.poll().unwrap()), vec!["new line"]);
    }

    #[test]
    fn test_backfill_reads_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, b"one\ntwo\n");

        let mut tailer = LogTailer::new("sshd", &path, true);
        assert_eq!(lines(tailer.poll().unwrap()), vec!["one", "two"]);
        assert!(tailer.poll().unwrap().is_empty());
    }

    #[test]
    fn test_partial_line_waits_for_newline() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, b"");

        let mut tailer = LogTailer::new("sshd", &path, false);
        tailer.poll().unwrap();

        append(&path, b"Failed password for ro");
        assert!(tailer.poll().unwrap().is_empty());

        append(&path, b"ot from 203.0.113.7\r\n");
        assert_eq!(
            lines(tailer.poll().unwrap()),
            vec!["Failed password for root from 203.0.113.7"]
        );
    }

    #[test]
    fn test_truncation_restarts_at_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, b"");
        let mut tailer = LogTailer::new("sshd", &path, false);
        tailer.poll().unwrap();

        append(&path, b"a fairly long first line\n");
        assert_eq!(tailer.poll().unwrap().len(), 1);

        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(0)
            .unwrap();
        append(&path, b"short\n");

        assert_eq!(lines(tailer.poll().unwrap()), vec!["short"]);
        assert_eq!(tailer.position(), 6);
    }

    #[test]
    fn test_rotation_drains_old_file_first() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        let rotated = dir.path().join("auth.log.1");
        append(&path, b"");

        let mut tailer = LogTailer::new("sshd", &path, false);
        tailer.poll().unwrap();
        append(&path, b"before\n");

        std::fs::rename(&path, &rotated).unwrap();
        // Writer still holds the old file
        append(&rotated, b"late\n");
        // Nothing at the path yet; old handle keeps draining
        assert_eq!(lines(tailer.poll().unwrap()), vec!["before", "late"]);

        append(&rotated, b"tail without newline");
        append(&path, b"fresh\n");
        assert_eq!(
            lines(tailer.poll().unwrap()),
            vec!["tail without newline", "fresh"]
        );
    }

    #[test]
    fn test_rotated_lines_kept_when_reopen_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        let rotated = dir.path().join("auth.log.1");
        append(&path, b"");

        let mut tailer = LogTailer::new("sshd", &path, false);
        tailer.poll().unwrap();
        append(&path, b"before\n");
        std::fs::rename(&path, &rotated).unwrap();

        // A socket at the path has metadata but cannot be opened
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        assert_eq!(lines(tailer.poll().unwrap()), vec!["before"]);
        assert!(tailer.poll().is_err());

        drop(listener);
        std::fs::remove_file(&path).unwrap();
        append(&path, b"after\n");
        assert_eq!(lines(tailer.poll().unwrap()), vec!["after"]);
    }

    #[test]
    fn test_backlog_is_read_in_batches() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        let text: String = (0..MAX_BATCH_LINES + 6)
            .map(|i| format!("line {}\n", i))
            .collect();
        append(&path, text.as_bytes());

        let mut tailer = LogTailer::new("sshd", &path, true);
        let first = tailer.poll().unwrap();
        assert_eq!(first.len(), MAX_BATCH_LINES);
        assert!(tailer.has_backlog());

        let rest = lines(tailer.poll().unwrap());
        assert_eq!(rest.len(), 6);
        assert_eq!(rest[0], format!("line {}", MAX_BATCH_LINES));
        assert!(!tailer.has_backlog());
        assert_eq!(tailer.position(), text.len() as u64);
    }

    #[test]
    fn test_overlong_line_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, b"");
        let mut tailer = LogTailer::new("sshd", &path, false);
        tailer.poll().unwrap();

        append(&path, &vec![b'a'; MAX_LINE_BYTES * 2]);
        assert!(tailer.poll().unwrap().is_empty());
        append(&path, &vec![b'a'; MAX_LINE_BYTES]);
        assert!(tailer.poll().unwrap().is_empty());

        append(&path, b"\nnext\n");
        let got = lines(tailer.poll().unwrap());
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].len(), MAX_LINE_BYTES);
        assert_eq!(got[1], "next");
    }

    #[test]
    fn test_invalid_utf8_decoded_lossily() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, &[0xff, b'o', b'k', b'\n']);

        let mut tailer = LogTailer::new("sshd", &path, true);
        assert_eq!(lines(tailer.poll().unwrap()), vec!["\u{FFFD}ok"]);
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.log");
        let mut tailer = LogTailer::new("sshd", &path, false);
        assert_eq!(
            tailer.poll().unwrap_err().kind(),
            io::ErrorKind::NotFound
        );

        // A file created later is read from the start
        append(&path, b"first\n");
        assert_eq!(lines(tailer.poll().unwrap()), vec!["first"]);
    }

    #[tokio::test]
    async fn test_run_tailer_reports_degraded_then_recovers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("late.log");

        let (tx, mut rx) = mpsc::channel(8);
        let (health_tx, mut health_rx) = watch::channel(SourceHealth::Starting);
        let (stop_tx, stop_rx) = watch::channel(false);

        let opts = TailOptions {
            poll_interval: Duration::from_millis(10),
            degraded_after: 2,
            backoff_max: Duration::from_millis(20),
        };
        let task = tokio::spawn(run_tailer(
            LogTailer::new("late", &path, false),
            opts,
            tx,
            health_tx,
            stop_rx,
        ));

        tokio::time::timeout(
            Duration::from_secs(5),
            health_rx.wait_for(|h| h.is_degraded()),
        )
        .await
        .unwrap()
        .unwrap();

        append(&path, b"hello\n");
        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch[0].raw_line, "hello");
        assert_eq!(*health_rx.borrow(), SourceHealth::Healthy);

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
