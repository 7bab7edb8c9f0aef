use std::sync::Arc;

use serde::Serialize;

use super::store::{PendingFile, StoreError};
use super::worker::UploadContext;

/// One line of the "recent activity" feed.
#[derive(Debug, Clone, Serialize)]
pub struct RecentEntry {
    pub name: String,
    pub state: String,
    pub timestamp: i64,
}

/// Point-in-time view of the whole pipeline, pulled on demand.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub online: bool,
    pub needs_login: bool,
    pub uploading: usize,
    pub queue_size: i64,
    pub recent: Vec<RecentEntry>,
}

pub struct StatusReporter {
    ctx: Arc<UploadContext>,
}

impl StatusReporter {
    pub fn new(ctx: Arc<UploadContext>) -> Self {
        Self { ctx }
    }

    pub async fn snapshot(&self) -> Result<StatusSnapshot, StoreError> {
        let queue = self.ctx.queue.snapshot().await?;
        Ok(StatusSnapshot {
            online: self.ctx.connectivity.is_online(),
            needs_login: self.ctx.needs_login(),
            uploading: self.ctx.uploading_count(),
            queue_size: queue.counts.active(),
            recent: queue.recent.iter().map(recent_entry).collect(),
        })
    }
}

fn recent_entry(file: &PendingFile) -> RecentEntry {
    RecentEntry {
        name: file.display_name.clone(),
        state: file.state.as_str().to_string(),
        timestamp: file.queued_at,
    }
}

impl StatusSnapshot {
    /// Compact one-liner for the periodic daemon log.
    pub fn summary(&self) -> String {
        format!(
            "online={} needs_login={} uploading={} queued={}",
            self.online, self.needs_login, self.uploading, self.queue_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::connectivity::ConnectivityMonitor;
    use crate::ingest::queue::QueueManager;
    use crate::ingest::stability::ReadyFile;
    use crate::ingest::store::QueueStore;

    async fn make_context() -> Arc<UploadContext> {
        keyring::set_default_credential_builder(keyring::mock::default_credential_builder());
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = QueueStore::from_pool(pool);
        store.init().await.unwrap();
        let queue = Arc::new(QueueManager::new(store, 3));
        let connectivity = Arc::new(ConnectivityMonitor::new());
        let credentials = Arc::new(crate::credentials::CredentialStore::new().unwrap());
        Arc::new(UploadContext::new(queue, connectivity, credentials))
    }

    #[tokio::test]
    async fn snapshot_reflects_the_queue() {
        let ctx = make_context().await;
        ctx.queue
            .enqueue(&ReadyFile {
                path: "/inbox/a.pdf".into(),
                size: 10,
                modified: None,
            })
            .await
            .unwrap();

        let snapshot = StatusReporter::new(ctx).snapshot().await.unwrap();
        assert!(!snapshot.online);
        assert!(!snapshot.needs_login);
        assert_eq!(snapshot.uploading, 0);
        assert_eq!(snapshot.queue_size, 1);
        assert_eq!(snapshot.recent.len(), 1);
        assert_eq!(snapshot.recent[0].name, "a.pdf");
        assert_eq!(snapshot.recent[0].state, "queued");
    }

    #[test]
    fn summary_is_a_single_line() {
        let snapshot = StatusSnapshot {
            online: true,
            needs_login: false,
            uploading: 2,
            queue_size: 5,
            recent: Vec::new(),
        };
        assert_eq!(
            snapshot.summary(),
            "online=true needs_login=false uploading=2 queued=5"
        );
    }
}
