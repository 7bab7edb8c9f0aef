use std::{fs, path::PathBuf};

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const RECENT_LIMIT: i64 = 15;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid file state: {0}")]
    InvalidState(String),
    #[error("record not found after upsert")]
    MissingRecord,
}

/// Persisted lifecycle of a pending file. `uploaded` and `discarded` are
/// terminal; everything else is reloaded after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Queued,
    Uploading,
    Retrying,
    Uploaded,
    Discarded,
}

impl FileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Queued => "queued",
            FileState::Uploading => "uploading",
            FileState::Retrying => "retrying",
            FileState::Uploaded => "uploaded",
            FileState::Discarded => "discarded",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "queued" => Ok(FileState::Queued),
            "uploading" => Ok(FileState::Uploading),
            "retrying" => Ok(FileState::Retrying),
            "uploaded" => Ok(FileState::Uploaded),
            "discarded" => Ok(FileState::Discarded),
            other => Err(StoreError::InvalidState(other.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FileState::Uploaded | FileState::Discarded)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingFile {
    pub id: i64,
    pub path: String,
    pub display_name: String,
    pub size: Option<i64>,
    pub modified: Option<i64>,
    pub detected_at: i64,
    pub queued_at: i64,
    pub attempt: i64,
    pub state: FileState,
    pub last_error: Option<String>,
    pub retry_at: Option<i64>,
    pub upload_key: String,
}

#[derive(Debug, Clone)]
pub struct NewPendingFile {
    pub path: String,
    pub display_name: String,
    pub size: Option<i64>,
    pub modified: Option<i64>,
    pub detected_at: i64,
    pub upload_key: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub queued: i64,
    pub uploading: i64,
    pub retrying: i64,
    pub uploaded: i64,
    pub discarded: i64,
}

impl StateCounts {
    /// Everything still owed to the server.
    pub fn active(&self) -> i64 {
        self.queued + self.uploading + self.retrying
    }
}

pub struct QueueStore {
    pool: SqlitePool,
}

impl QueueStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, StoreError> {
        let db_path = default_db_path()?;
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Creates or refreshes the record for a path. While a record is in a
    /// non-terminal state the upsert only refreshes the metadata snapshot
    /// (the OS re-announcing a file must not reset its place in line or
    /// its attempt count); a terminal record is reborn as a fresh queued
    /// item with the new upload key.
    pub async fn upsert_pending(&self, input: &NewPendingFile) -> Result<PendingFile, StoreError> {
        sqlx::query(
            "INSERT INTO pending_files (
                path, display_name, size, modified,
                detected_at, queued_at, attempt, state,
                last_error, retry_at, upload_key
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?5, 0, 'queued', NULL, NULL, ?6)
            ON CONFLICT(path) DO UPDATE SET
                display_name = excluded.display_name,
                size = excluded.size,
                modified = excluded.modified,
                detected_at = CASE WHEN pending_files.state IN ('uploaded', 'discarded')
                    THEN excluded.detected_at ELSE pending_files.detected_at END,
                queued_at = CASE WHEN pending_files.state IN ('uploaded', 'discarded')
                    THEN excluded.queued_at ELSE pending_files.queued_at END,
                attempt = CASE WHEN pending_files.state IN ('uploaded', 'discarded')
                    THEN 0 ELSE pending_files.attempt END,
                upload_key = CASE WHEN pending_files.state IN ('uploaded', 'discarded')
                    THEN excluded.upload_key ELSE pending_files.upload_key END,
                last_error = CASE WHEN pending_files.state IN ('uploaded', 'discarded')
                    THEN NULL ELSE pending_files.last_error END,
                retry_at = CASE WHEN pending_files.state IN ('uploaded', 'discarded')
                    THEN NULL ELSE pending_files.retry_at END,
                state = CASE WHEN pending_files.state IN ('uploaded', 'discarded')
                    THEN 'queued' ELSE pending_files.state END;",
        )
        .bind(&input.path)
        .bind(&input.display_name)
        .bind(input.size)
        .bind(input.modified)
        .bind(input.detected_at)
        .bind(&input.upload_key)
        .execute(&self.pool)
        .await?;

        self.get_by_path(&input.path)
            .await?
            .ok_or(StoreError::MissingRecord)
    }

    pub async fn get_by_path(&self, path: &str) -> Result<Option<PendingFile>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM pending_files WHERE path = ?1"
        ))
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.map(read_row).transpose()
    }

    pub async fn get(&self, id: i64) -> Result<Option<PendingFile>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM pending_files WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(read_row).transpose()
    }

    /// Atomically claims the oldest due item: the single statement marks
    /// it `uploading` and counts the attempt, so a second worker can never
    /// take the same record. Retried items are due only once their
    /// retry time has elapsed, and their refreshed `queued_at` puts them
    /// at the back of the line.
    pub async fn claim_next(&self, now: i64) -> Result<Option<PendingFile>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE pending_files
             SET state = 'uploading', attempt = attempt + 1
             WHERE id = (
                 SELECT id FROM pending_files
                 WHERE state = 'queued'
                    OR (state = 'retrying' AND retry_at IS NOT NULL AND retry_at <= ?1)
                 ORDER BY queued_at ASC, id ASC
                 LIMIT 1
             )
             RETURNING {COLUMNS}"
        ))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(read_row).transpose()
    }

    pub async fn set_uploaded(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE pending_files
             SET state = 'uploaded', last_error = NULL, retry_at = NULL
             WHERE id = ?1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_retrying(
        &self,
        id: i64,
        retry_at: i64,
        last_error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE pending_files
             SET state = 'retrying', retry_at = ?2, queued_at = ?2, last_error = ?3
             WHERE id = ?1",
        )
        .bind(id)
        .bind(retry_at)
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_discarded(&self, id: i64, last_error: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE pending_files
             SET state = 'discarded', retry_at = NULL, last_error = ?2
             WHERE id = ?1",
        )
        .bind(id)
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Hands a claimed item back without consuming the attempt (offline
    /// hand-back and authentication pauses must not eat the ceiling).
    pub async fn release(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE pending_files
             SET state = 'queued', retry_at = NULL, attempt = MAX(attempt - 1, 0)
             WHERE id = ?1 AND state = 'uploading'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Startup recovery: an `uploading` row means the previous process
    /// died mid-transfer. Re-queue it; the stable upload key makes the
    /// repeat attempt idempotent server-side.
    pub async fn recover(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE pending_files
             SET state = 'queued', retry_at = NULL
             WHERE state = 'uploading'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn counts_by_state(&self) -> Result<StateCounts, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM pending_files GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = StateCounts::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            match FileState::parse(&state)? {
                FileState::Queued => counts.queued = n,
                FileState::Uploading => counts.uploading = n,
                FileState::Retrying => counts.retrying = n,
                FileState::Uploaded => counts.uploaded = n,
                FileState::Discarded => counts.discarded = n,
            }
        }
        Ok(counts)
    }

    /// Bounded ring of the newest records (any state) for the status menu.
    pub async fn recent(&self) -> Result<Vec<PendingFile>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM pending_files
             ORDER BY detected_at DESC, id DESC
             LIMIT ?1"
        ))
        .bind(RECENT_LIMIT)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(read_row).collect()
    }
}

const COLUMNS: &str = "id, path, display_name, size, modified, detected_at, queued_at, attempt, state, last_error, retry_at, upload_key";

fn read_row(row: sqlx::sqlite::SqliteRow) -> Result<PendingFile, StoreError> {
    let state: String = row.try_get("state")?;
    Ok(PendingFile {
        id: row.try_get("id")?,
        path: row.try_get("path")?,
        display_name: row.try_get("display_name")?,
        size: row.try_get("size")?,
        modified: row.try_get("modified")?,
        detected_at: row.try_get("detected_at")?,
        queued_at: row.try_get("queued_at")?,
        attempt: row.try_get("attempt")?,
        state: FileState::parse(&state)?,
        last_error: row.try_get("last_error")?,
        retry_at: row.try_get("retry_at")?,
        upload_key: row.try_get("upload_key")?,
    })
}

fn default_db_path() -> Result<PathBuf, StoreError> {
    let data_dir = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    Ok(data_dir.join("inbox-agent").join("queue.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_store() -> QueueStore {
        // One connection: every pooled connection would otherwise get its
        // own private in-memory database.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = QueueStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    fn input(path: &str, detected_at: i64) -> NewPendingFile {
        NewPendingFile {
            path: path.to_string(),
            display_name: path.rsplit('/').next().unwrap().to_string(),
            size: Some(100),
            modified: Some(detected_at),
            detected_at,
            upload_key: format!("key-{path}-{detected_at}"),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_while_pending() {
        let store = make_store().await;
        let first = store.upsert_pending(&input("/inbox/a.pdf", 100)).await.unwrap();
        assert_eq!(first.state, FileState::Queued);
        assert_eq!(first.attempt, 0);

        // The OS re-announces the same file: same record, same place in line.
        let second = store.upsert_pending(&input("/inbox/a.pdf", 200)).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.detected_at, 100);
        assert_eq!(second.queued_at, first.queued_at);
        assert_eq!(second.upload_key, first.upload_key);
    }

    #[tokio::test]
    async fn terminal_record_is_reborn_as_queued() {
        let store = make_store().await;
        let first = store.upsert_pending(&input("/inbox/a.pdf", 100)).await.unwrap();
        store.set_uploaded(first.id).await.unwrap();

        let reborn = store.upsert_pending(&input("/inbox/a.pdf", 500)).await.unwrap();
        assert_eq!(reborn.id, first.id);
        assert_eq!(reborn.state, FileState::Queued);
        assert_eq!(reborn.attempt, 0);
        assert_eq!(reborn.detected_at, 500);
        assert_ne!(reborn.upload_key, first.upload_key);
    }

    #[tokio::test]
    async fn claim_is_fifo_and_exclusive() {
        let store = make_store().await;
        store.upsert_pending(&input("/inbox/a.pdf", 100)).await.unwrap();
        store.upsert_pending(&input("/inbox/b.pdf", 200)).await.unwrap();

        let first = store.claim_next(1_000).await.unwrap().unwrap();
        assert_eq!(first.path, "/inbox/a.pdf");
        assert_eq!(first.state, FileState::Uploading);
        assert_eq!(first.attempt, 1);

        // The claimed record is invisible to a second claimer.
        let second = store.claim_next(1_000).await.unwrap().unwrap();
        assert_eq!(second.path, "/inbox/b.pdf");
        assert!(store.claim_next(1_000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retrying_items_wait_for_their_retry_time_and_move_to_the_back() {
        let store = make_store().await;
        let a = store.upsert_pending(&input("/inbox/a.pdf", 100)).await.unwrap();
        store.upsert_pending(&input("/inbox/b.pdf", 200)).await.unwrap();

        let claimed = store.claim_next(1_000).await.unwrap().unwrap();
        assert_eq!(claimed.id, a.id);
        store.set_retrying(a.id, 2_000, "boom").await.unwrap();

        // Before the retry time only b is due; afterwards a re-enters at
        // the back even though it was enqueued first.
        let next = store.claim_next(1_500).await.unwrap().unwrap();
        assert_eq!(next.path, "/inbox/b.pdf");
        store.release(next.id).await.unwrap();

        let next = store.claim_next(2_500).await.unwrap().unwrap();
        assert_eq!(next.path, "/inbox/b.pdf", "retried item goes behind fresh ones");
        let last = store.claim_next(2_500).await.unwrap().unwrap();
        assert_eq!(last.path, "/inbox/a.pdf");
        assert_eq!(last.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn release_returns_the_claim_without_counting_the_attempt() {
        let store = make_store().await;
        let a = store.upsert_pending(&input("/inbox/a.pdf", 100)).await.unwrap();

        let claimed = store.claim_next(1_000).await.unwrap().unwrap();
        assert_eq!(claimed.attempt, 1);
        store.release(a.id).await.unwrap();

        let again = store.get(a.id).await.unwrap().unwrap();
        assert_eq!(again.state, FileState::Queued);
        assert_eq!(again.attempt, 0);
    }

    #[tokio::test]
    async fn recover_requeues_interrupted_uploads() {
        let store = make_store().await;
        let a = store.upsert_pending(&input("/inbox/a.pdf", 100)).await.unwrap();
        store.claim_next(1_000).await.unwrap().unwrap();

        assert_eq!(store.recover().await.unwrap(), 1);
        let again = store.get(a.id).await.unwrap().unwrap();
        assert_eq!(again.state, FileState::Queued);
    }

    #[tokio::test]
    async fn counts_and_recent_reflect_the_queue() {
        let store = make_store().await;
        let a = store.upsert_pending(&input("/inbox/a.pdf", 100)).await.unwrap();
        store.upsert_pending(&input("/inbox/b.pdf", 200)).await.unwrap();
        store.set_uploaded(a.id).await.unwrap();

        let counts = store.counts_by_state().await.unwrap();
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.uploaded, 1);
        assert_eq!(counts.active(), 1);

        let recent = store.recent().await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].path, "/inbox/b.pdf");
    }
}
