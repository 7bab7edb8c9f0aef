use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::debug;
use tokio::sync::mpsc;

use super::watcher::{RawEvent, RawEventKind};

/// Size and mtime observed for a file that is still settling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSnapshot {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// A file judged complete: its metadata survived a full quiet interval
/// unchanged. Exactly one of these is emitted per settled path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    Ready(FileSnapshot),
    Rearmed,
    Gone,
}

struct PendingCheck {
    snapshot: FileSnapshot,
    due_at: Instant,
}

/// Decides when a file has finished being written. Editors and browsers
/// write incrementally; a path is only "ready" once its (size, mtime)
/// snapshot is unchanged across the quiet interval. Pure bookkeeping —
/// the caller supplies snapshots and the clock, which keeps it testable.
pub struct StabilityTracker {
    quiet: Duration,
    pending: HashMap<PathBuf, PendingCheck>,
}

impl StabilityTracker {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending: HashMap::new(),
        }
    }

    /// Records a write observation and (re)schedules the quiet-interval
    /// recheck for the path.
    pub fn observe(&mut self, path: PathBuf, snapshot: FileSnapshot, now: Instant) {
        self.pending.insert(
            path,
            PendingCheck {
                snapshot,
                due_at: now + self.quiet,
            },
        );
    }

    /// The file was removed before it settled; whoever took it away wins.
    pub fn cancel(&mut self, path: &Path) {
        self.pending.remove(path);
    }

    pub fn due_paths(&self, now: Instant) -> Vec<PathBuf> {
        self.pending
            .iter()
            .filter(|(_, check)| check.due_at <= now)
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.pending.values().map(|check| check.due_at).min()
    }

    /// Compares the recorded snapshot against the current one. Unchanged
    /// and non-empty means ready (and the path is forgotten); changed
    /// re-arms with the fresh snapshot; a vanished file is dropped.
    pub fn settle(&mut self, path: &Path, current: Option<FileSnapshot>, now: Instant) -> Settle {
        let Some(check) = self.pending.get_mut(path) else {
            return Settle::Gone;
        };
        match current {
            None => {
                self.pending.remove(path);
                Settle::Gone
            }
            Some(snapshot) if snapshot == check.snapshot && snapshot.size > 0 => {
                self.pending.remove(path);
                Settle::Ready(snapshot)
            }
            Some(snapshot) => {
                check.snapshot = snapshot;
                check.due_at = now + self.quiet;
                Settle::Rearmed
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Consumes raw watcher events, stats files around the quiet interval and
/// forwards ready files downstream. Ends when the watcher channel closes
/// (folder re-subscription drops the old pump with it).
pub async fn run_stability_pump(
    mut events: mpsc::UnboundedReceiver<RawEvent>,
    ready_tx: mpsc::UnboundedSender<ReadyFile>,
    quiet: Duration,
) {
    let mut tracker = StabilityTracker::new(quiet);
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event.kind {
                    RawEventKind::Created | RawEventKind::Modified => {
                        if let Some(snapshot) = stat(&event.path).await {
                            tracker.observe(event.path, snapshot, Instant::now());
                        }
                    }
                    RawEventKind::Removed => tracker.cancel(&event.path),
                }
            }
            _ = wait_until(tracker.next_due()) => {
                let now = Instant::now();
                for path in tracker.due_paths(now) {
                    let current = stat(&path).await;
                    match tracker.settle(&path, current, now) {
                        Settle::Ready(snapshot) => {
                            let ready = ReadyFile {
                                path: path.clone(),
                                size: snapshot.size,
                                modified: snapshot.modified.and_then(unix_seconds),
                            };
                            if ready_tx.send(ready).is_err() {
                                return;
                            }
                        }
                        Settle::Rearmed => debug!("still settling: {}", path.display()),
                        Settle::Gone => debug!("vanished before settling: {}", path.display()),
                    }
                }
            }
        }
    }
}

async fn wait_until(due: Option<Instant>) {
    match due {
        Some(instant) => tokio::time::sleep_until(tokio::time::Instant::from_std(instant)).await,
        None => std::future::pending().await,
    }
}

async fn stat(path: &Path) -> Option<FileSnapshot> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    if !meta.is_file() {
        return None;
    }
    Some(FileSnapshot {
        size: meta.len(),
        modified: meta.modified().ok(),
    })
}

fn unix_seconds(time: SystemTime) -> Option<i64> {
    time.duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs() as i64)
}
