use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use inbox_core::InboxClient;
use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{AgentConfig, ConfigStore};
use crate::credentials::CredentialStore;
use crate::ingest::connectivity::{ConnectivityMonitor, run_probe_loop};
use crate::ingest::queue::QueueManager;
use crate::ingest::stability::{ReadyFile, run_stability_pump};
use crate::ingest::status::StatusReporter;
use crate::ingest::store::QueueStore;
use crate::ingest::watcher::{IgnoreRules, scan_existing, start_notify_watcher};
use crate::ingest::worker::{UploadContext, run_upload_worker};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

pub struct DaemonRuntime {
    config_store: Arc<ConfigStore>,
    ctx: Arc<UploadContext>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config_store: ConfigStore) -> anyhow::Result<Self> {
        let inbox_dir = config_store
            .ensure_inbox_dir()
            .context("failed to create the inbox folder")?;

        let store = QueueStore::new_default()
            .await
            .context("failed to initialize the queue database")?;
        let config = config_store.get();
        let queue = Arc::new(QueueManager::new(store, config.max_attempts));
        let connectivity = Arc::new(ConnectivityMonitor::new());
        let credentials =
            Arc::new(CredentialStore::new().context("system keyring is unavailable")?);
        let ctx = Arc::new(UploadContext::new(queue, connectivity, credentials));

        ctx.queue
            .recover()
            .await
            .context("failed to recover interrupted uploads")?;

        info!("inbox folder: {}", inbox_dir.display());
        Ok(Self {
            config_store: Arc::new(config_store),
            ctx,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let mut config_rx = self.config_store.subscribe();
        let mut current = config_rx.borrow_and_update().clone();
        info!(
            "started: server={} concurrency={} max_attempts={}",
            if current.server_url.is_empty() {
                "<unset>"
            } else {
                current.server_url.as_str()
            },
            current.upload_concurrency,
            current.max_attempts
        );
        if !self.ctx.credentials.has_token() {
            warn!("no saved session; uploads wait until someone logs in");
        }

        let mut pipeline = FolderPipeline::start(&current, Arc::clone(&self.ctx.queue))?;
        enqueue_existing(&self.ctx.queue, &current).await;

        let mut probe = spawn_probe(
            &current,
            Arc::clone(&self.ctx.connectivity),
            self.ctx.http.clone(),
        );

        let workers: Vec<JoinHandle<()>> = (0..current.upload_concurrency.max(1))
            .map(|id| {
                tokio::spawn(run_upload_worker(
                    Arc::clone(&self.ctx),
                    self.config_store.subscribe(),
                    id,
                ))
            })
            .collect();

        let reporter = StatusReporter::new(Arc::clone(&self.ctx));
        let status_handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(STATUS_LOG_INTERVAL).await;
                match reporter.snapshot().await {
                    Ok(snapshot) => info!("status: {}", snapshot.summary()),
                    Err(err) => error!("status snapshot failed: {err}"),
                }
            }
        });

        loop {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res.context("failed waiting for shutdown signal")?;
                    info!("shutdown requested");
                    break;
                }
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = config_rx.borrow_and_update().clone();
                    self.apply_config_change(&current, &next, &mut pipeline, &mut probe)
                        .await?;
                    current = next;
                }
            }
        }

        pipeline.stop();
        for handle in workers {
            handle.abort();
        }
        if let Some(handle) = probe {
            handle.abort();
        }
        status_handle.abort();
        Ok(())
    }

    /// Swaps the folder pipeline and the probe when the settings they were
    /// built from change. Workers read config per attempt and need no
    /// restart.
    async fn apply_config_change(
        &self,
        current: &AgentConfig,
        next: &AgentConfig,
        pipeline: &mut FolderPipeline,
        probe: &mut Option<JoinHandle<()>>,
    ) -> anyhow::Result<()> {
        let folder_changed = next.inbox_dir != current.inbox_dir
            || next.extra_ignores != current.extra_ignores
            || next.quiet_interval_ms != current.quiet_interval_ms;
        if folder_changed {
            info!("inbox folder settings changed, re-subscribing watcher");
            tokio::fs::create_dir_all(&next.inbox_dir)
                .await
                .with_context(|| {
                    format!("failed to create the inbox folder at {:?}", next.inbox_dir)
                })?;
            let old = std::mem::replace(
                pipeline,
                FolderPipeline::start(next, Arc::clone(&self.ctx.queue))?,
            );
            old.stop();
            enqueue_existing(&self.ctx.queue, next).await;
        }

        if next.server_url != current.server_url
            || next.probe_interval_secs != current.probe_interval_secs
        {
            if let Some(handle) = probe.take() {
                handle.abort();
            }
            *probe = spawn_probe(
                next,
                Arc::clone(&self.ctx.connectivity),
                self.ctx.http.clone(),
            );
        }
        Ok(())
    }
}

/// The watch-settle-enqueue chain for one inbox folder. Dropping the
/// watcher closes the raw event channel, which ends the stability pump,
/// which closes the ready channel and ends the consumer; aborts are only
/// a backstop.
struct FolderPipeline {
    _watcher: notify::RecommendedWatcher,
    pump: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

impl FolderPipeline {
    fn start(config: &AgentConfig, queue: Arc<QueueManager>) -> anyhow::Result<Self> {
        let rules = IgnoreRules::new(config.extra_ignores.clone());
        let (watcher, raw_rx) = start_notify_watcher(&config.inbox_dir, rules)
            .with_context(|| format!("failed to watch {:?}", config.inbox_dir))?;

        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel::<ReadyFile>();
        let pump = tokio::spawn(run_stability_pump(
            raw_rx,
            ready_tx,
            config.quiet_interval(),
        ));
        let consumer = tokio::spawn(async move {
            while let Some(ready) = ready_rx.recv().await {
                if let Err(err) = queue.enqueue(&ready).await {
                    error!("could not enqueue {}: {err}", ready.path.display());
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            pump,
            consumer,
        })
    }

    fn stop(self) {
        self.pump.abort();
        self.consumer.abort();
    }
}

/// Files already sitting in the folder were dropped while the agent was
/// not running; they have long since settled and go straight to the queue.
async fn enqueue_existing(queue: &QueueManager, config: &AgentConfig) {
    let rules = IgnoreRules::new(config.extra_ignores.clone());
    for path in scan_existing(&config.inbox_dir, &rules) {
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            continue;
        };
        if !meta.is_file() || meta.len() == 0 {
            continue;
        }
        let ready = ReadyFile {
            path: path.clone(),
            size: meta.len(),
            modified: meta.modified().ok().and_then(unix_seconds),
        };
        if let Err(err) = queue.enqueue(&ready).await {
            error!("could not enqueue {}: {err}", path.display());
        }
    }
}

fn spawn_probe(
    config: &AgentConfig,
    monitor: Arc<ConnectivityMonitor>,
    http: reqwest::Client,
) -> Option<JoinHandle<()>> {
    if config.server_url.is_empty() {
        warn!("no server configured; staying offline until one is set");
        return None;
    }
    match InboxClient::with_http(http, &config.server_url, "") {
        Ok(client) => Some(tokio::spawn(run_probe_loop(
            monitor,
            client,
            config.probe_interval(),
        ))),
        Err(err) => {
            error!("invalid server url {:?}: {err}", config.server_url);
            None
        }
    }
}

fn unix_seconds(time: SystemTime) -> Option<i64> {
    time.duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::store::FileState;

    async fn make_queue() -> Arc<QueueManager> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = QueueStore::from_pool(pool);
        store.init().await.unwrap();
        Arc::new(QueueManager::new(store, 3))
    }

    #[tokio::test]
    async fn startup_scan_queues_existing_documents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("invoice.pdf"), b"contents").unwrap();
        std::fs::write(dir.path().join(".DS_Store"), b"junk").unwrap();
        std::fs::write(dir.path().join("empty.pdf"), b"").unwrap();

        let queue = make_queue().await;
        let config = AgentConfig {
            inbox_dir: dir.path().to_path_buf(),
            ..AgentConfig::default()
        };
        enqueue_existing(&queue, &config).await;

        let snapshot = queue.snapshot().await.unwrap();
        assert_eq!(snapshot.counts.queued, 1);
        assert_eq!(snapshot.recent[0].display_name, "invoice.pdf");
        assert_eq!(snapshot.recent[0].state, FileState::Queued);
    }

    #[tokio::test]
    async fn pipeline_enqueues_a_file_dropped_into_the_folder() {
        let dir = tempfile::tempdir().unwrap();
        let queue = make_queue().await;
        let config = AgentConfig {
            inbox_dir: dir.path().to_path_buf(),
            quiet_interval_ms: 50,
            ..AgentConfig::default()
        };

        let pipeline = FolderPipeline::start(&config, Arc::clone(&queue)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(dir.path().join("contract.pdf"), b"signed").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = queue.snapshot().await.unwrap();
            if snapshot.counts.queued == 1 {
                assert_eq!(snapshot.recent[0].display_name, "contract.pdf");
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("file never reached the queue: {:?}", snapshot.counts);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        pipeline.stop();
    }
}
