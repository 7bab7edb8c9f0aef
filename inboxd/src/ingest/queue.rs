use std::time::Duration;

use log::{info, warn};
use tokio::sync::Notify;

use super::backoff::Backoff;
use super::stability::ReadyFile;
use super::store::{NewPendingFile, PendingFile, QueueStore, StateCounts, StoreError};

const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Retrying at the given unix time; re-enters the queue at the back.
    RetryAt(i64),
    /// Retry ceiling reached; the record is dead-lettered.
    DeadLetter,
}

#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub counts: StateCounts,
    pub recent: Vec<PendingFile>,
}

/// The single authority over pending-file state. Watcher and workers only
/// propose transitions through these operations; every transition hits
/// durable storage before the call returns, so a crash between any two
/// steps never loses a file.
pub struct QueueManager {
    store: QueueStore,
    backoff: Backoff,
    max_attempts: u32,
    work_added: Notify,
}

impl QueueManager {
    pub fn new(store: QueueStore, max_attempts: u32) -> Self {
        Self::with_backoff(store, max_attempts, Backoff::new(BACKOFF_BASE, BACKOFF_MAX, true))
    }

    pub fn with_backoff(store: QueueStore, max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            store,
            backoff,
            max_attempts: max_attempts.max(1),
            work_added: Notify::new(),
        }
    }

    /// Admits a settled file into the queue. Idempotent for a path that is
    /// already pending; a path that finished a previous lifecycle starts a
    /// new one with a fresh upload key.
    pub async fn enqueue(&self, ready: &ReadyFile) -> Result<PendingFile, StoreError> {
        let path = ready.path.to_string_lossy().to_string();
        let display_name = ready
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.clone());
        let detected_at = now_unix();
        let input = NewPendingFile {
            upload_key: upload_key(&path, detected_at),
            path,
            display_name,
            size: Some(ready.size as i64),
            modified: ready.modified,
            detected_at,
        };

        let record = self.store.upsert_pending(&input).await?;
        info!(
            "queued {} (id={}, attempt={})",
            record.display_name, record.id, record.attempt
        );
        self.work_added.notify_one();
        Ok(record)
    }

    /// Claims the oldest due item for a worker, or none. The claim is
    /// recorded durably, so two workers can never hold the same file.
    pub async fn next_ready(&self) -> Result<Option<PendingFile>, StoreError> {
        self.store.claim_next(now_unix()).await
    }

    pub async fn mark_uploaded(&self, item: &PendingFile) -> Result<(), StoreError> {
        self.store.set_uploaded(item.id).await?;
        info!(
            "uploaded {} after {} attempt(s)",
            item.display_name, item.attempt
        );
        Ok(())
    }

    /// Records a counted failure: schedules a retry with backoff, or
    /// dead-letters the record once the ceiling is reached.
    pub async fn mark_failed(
        &self,
        item: &PendingFile,
        error: &str,
    ) -> Result<FailureDisposition, StoreError> {
        let attempt = item.attempt.max(0) as u32;
        if attempt >= self.max_attempts {
            self.store.set_discarded(item.id, error).await?;
            warn!(
                "giving up on {} after {attempt} attempts: {error}",
                item.display_name
            );
            return Ok(FailureDisposition::DeadLetter);
        }

        let delay = self.backoff.delay(attempt);
        let retry_at = now_unix() + delay.as_secs() as i64;
        self.store.set_retrying(item.id, retry_at, error).await?;
        info!(
            "retrying {} in {}s (attempt {attempt}/{}): {error}",
            item.display_name,
            delay.as_secs(),
            self.max_attempts
        );
        Ok(FailureDisposition::RetryAt(retry_at))
    }

    /// Returns a claim untouched (offline or needs-login); the attempt is
    /// not counted and the item keeps its place in line.
    pub async fn release(&self, item: &PendingFile) -> Result<(), StoreError> {
        self.store.release(item.id).await
    }

    /// Immediate dead-letter for permanent rejections and vanished files.
    pub async fn discard(&self, item: &PendingFile, reason: &str) -> Result<(), StoreError> {
        self.store.set_discarded(item.id, reason).await?;
        warn!("discarded {}: {reason}", item.display_name);
        Ok(())
    }

    pub async fn recover(&self) -> Result<u64, StoreError> {
        let requeued = self.store.recover().await?;
        if requeued > 0 {
            info!("requeued {requeued} interrupted upload(s) from the previous run");
        }
        Ok(requeued)
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, StoreError> {
        Ok(QueueSnapshot {
            counts: self.store.counts_by_state().await?,
            recent: self.store.recent().await?,
        })
    }

    /// Parks a worker until new work is enqueued or the idle interval
    /// elapses (whichever comes first; retry times need the periodic poll).
    pub async fn wait_for_work(&self, idle: Duration) {
        tokio::select! {
            _ = self.work_added.notified() => {}
            _ = tokio::time::sleep(idle) => {}
        }
    }

    pub fn wake_workers(&self) {
        self.work_added.notify_waiters();
    }
}

/// Stable per-file identifier sent with every attempt so the server can
/// deduplicate a re-upload after a crash mid-transfer.
fn upload_key(path: &str, detected_at: i64) -> String {
    format!("{:x}", md5::compute(format!("{path}|{detected_at}")))
}

fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
