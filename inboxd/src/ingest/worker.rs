use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use inbox_core::{ApiErrorClass, InboxClient, InboxError, NewDocument};
use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::config::{AgentConfig, PostUploadAction};
use crate::credentials::CredentialStore;

use super::connectivity::ConnectivityMonitor;
use super::queue::{FailureDisposition, QueueManager};
use super::store::PendingFile;

const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
const UPLOAD_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// Everything an upload worker needs, shared across the pool. Also the
/// surface the status reporter reads live counters from.
pub struct UploadContext {
    pub http: reqwest::Client,
    pub queue: Arc<QueueManager>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub credentials: Arc<CredentialStore>,
    needs_login: AtomicBool,
    in_flight: AtomicUsize,
}

impl UploadContext {
    pub fn new(
        queue: Arc<QueueManager>,
        connectivity: Arc<ConnectivityMonitor>,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            queue,
            connectivity,
            credentials,
            needs_login: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn needs_login(&self) -> bool {
        self.needs_login.load(Ordering::SeqCst)
    }

    pub fn uploading_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn enter_needs_login(&self) {
        if !self.needs_login.swap(true, Ordering::SeqCst) {
            warn!("server rejected the session token, pausing until re-login");
        }
    }

    fn leave_needs_login(&self) {
        if self.needs_login.swap(false, Ordering::SeqCst) {
            info!("credentials updated, resuming uploads");
        }
    }
}

enum AttemptOutcome {
    Uploaded,
    /// Transport failure; hand the claim back without counting it.
    Offline,
    /// The token was rejected; hand back and gate until re-login.
    AuthRejected,
    /// Counted failure (HTTP 429/5xx); backoff applies.
    Failed(String),
    /// The server rejected the document itself; no retry will help.
    Rejected(String),
    /// The file disappeared from disk before we could read it.
    SourceGone,
}

/// One worker of the upload pool. Loops forever claiming due items and
/// driving each through a single attempt; the daemon aborts the task on
/// shutdown (every state transition is durable, so this is safe at any
/// point).
pub async fn run_upload_worker(
    ctx: Arc<UploadContext>,
    mut config_rx: watch::Receiver<AgentConfig>,
    worker_id: usize,
) {
    let mut credential_rx = ctx.credentials.subscribe();
    loop {
        ctx.connectivity.wait_until_online().await;
        if ctx.needs_login() {
            // Parked until login/logout flips the credential version.
            if credential_rx.changed().await.is_err() {
                return;
            }
            if ctx.credentials.has_token() {
                ctx.leave_needs_login();
            }
            continue;
        }

        let config = config_rx.borrow_and_update().clone();
        let item = match ctx.queue.next_ready().await {
            Ok(Some(item)) => item,
            Ok(None) => {
                ctx.queue.wait_for_work(config.idle_interval()).await;
                continue;
            }
            Err(err) => {
                error!("worker {worker_id}: queue claim failed: {err}");
                tokio::time::sleep(config.idle_interval()).await;
                continue;
            }
        };

        ctx.in_flight.fetch_add(1, Ordering::SeqCst);
        let outcome = attempt_upload(&ctx, &config, &item).await;
        ctx.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Err(err) = settle_outcome(&ctx, &config, &item, outcome).await {
            error!("worker {worker_id}: could not record outcome: {err}");
        }
    }
}

async fn attempt_upload(
    ctx: &UploadContext,
    config: &AgentConfig,
    item: &PendingFile,
) -> AttemptOutcome {
    let Some(token) = ctx.credentials.current_token() else {
        return AttemptOutcome::AuthRejected;
    };
    let user_id = ctx.credentials.current_user_id().unwrap_or_default();

    let bytes = match tokio::fs::read(&item.path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return AttemptOutcome::SourceGone;
        }
        // No stable input remains (permission denied and the like); a
        // retry cannot help.
        Err(err) => return AttemptOutcome::Rejected(format!("read failed: {err}")),
    };

    let client = match InboxClient::with_http(ctx.http.clone(), &config.server_url, token) {
        Ok(client) => client,
        Err(err) => return AttemptOutcome::Rejected(format!("invalid server url: {err}")),
    };

    let doc = NewDocument {
        file_name: item.display_name.clone(),
        mime_type: guess_mime(&item.path),
        bytes,
        user_id,
        source_key: item.upload_key.clone(),
    };

    match client.upload_document(doc).await {
        Ok(record) => {
            debug!("created inbox record {} for {}", record.id, item.display_name);
            ctx.connectivity.set_online(true);
            AttemptOutcome::Uploaded
        }
        Err(err) if err.is_connectivity() => AttemptOutcome::Offline,
        Err(err) => {
            // Any HTTP answer, even a failure, proves the server is there.
            ctx.connectivity.set_online(true);
            match err.classification() {
                Some(ApiErrorClass::Auth) => AttemptOutcome::AuthRejected,
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient) => {
                    AttemptOutcome::Failed(short_error(&err))
                }
                _ => AttemptOutcome::Rejected(short_error(&err)),
            }
        }
    }
}

async fn settle_outcome(
    ctx: &UploadContext,
    config: &AgentConfig,
    item: &PendingFile,
    outcome: AttemptOutcome,
) -> Result<(), super::store::StoreError> {
    match outcome {
        AttemptOutcome::Uploaded => {
            // Durable success first; the local cleanup below may fail
            // without putting the file at risk of a double upload.
            ctx.queue.mark_uploaded(item).await?;
            apply_post_upload(config, &item.path).await;
        }
        AttemptOutcome::Offline => {
            ctx.connectivity.set_online(false);
            ctx.queue.release(item).await?;
        }
        AttemptOutcome::AuthRejected => {
            ctx.queue.release(item).await?;
            ctx.enter_needs_login();
        }
        AttemptOutcome::Failed(reason) => {
            if ctx.queue.mark_failed(item, &reason).await? == FailureDisposition::DeadLetter {
                move_to_dead_letter(config, &item.path).await;
            }
        }
        AttemptOutcome::Rejected(reason) => {
            ctx.queue.discard(item, &reason).await?;
            move_to_dead_letter(config, &item.path).await;
        }
        AttemptOutcome::SourceGone => {
            ctx.queue.discard(item, "file removed before upload").await?;
        }
    }
    Ok(())
}

async fn apply_post_upload(config: &AgentConfig, path: &str) {
    let source = Path::new(path);
    match config.post_upload {
        PostUploadAction::Delete => {
            if let Err(err) = tokio::fs::remove_file(source).await {
                warn!("could not delete {path}: {err}");
            }
        }
        PostUploadAction::MoveToSubfolder => {
            move_into(source, &config.uploaded_dir()).await;
        }
    }
}

async fn move_to_dead_letter(config: &AgentConfig, path: &str) {
    move_into(Path::new(path), &config.dead_letter_dir()).await;
}

/// Moves a file into a subfolder of the inbox, creating it on first use
/// and stepping around name collisions. Best effort: the queue record is
/// already settled, so a failed move only leaves the file where it was.
async fn move_into(source: &Path, dir: &Path) {
    if let Err(err) = tokio::fs::create_dir_all(dir).await {
        warn!("could not create {}: {err}", dir.display());
        return;
    }
    let Some(name) = source.file_name() else {
        return;
    };
    let target = unique_destination(dir, Path::new(name));
    if let Err(err) = tokio::fs::rename(source, &target).await {
        warn!(
            "could not move {} to {}: {err}",
            source.display(),
            target.display()
        );
    }
}

/// First free name in `dir` for `name`, numbering duplicates before the
/// extension: report.pdf, report-1.pdf, report-2.pdf, ...
fn unique_destination(dir: &Path, name: &Path) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string_lossy().to_string());
    let ext = name.extension().map(|e| e.to_string_lossy().to_string());
    for n in 1.. {
        let file_name = match &ext {
            Some(ext) => format!("{stem}-{n}.{ext}"),
            None => format!("{stem}-{n}"),
        };
        let candidate = dir.join(file_name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

fn guess_mime(path: &str) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

fn short_error(err: &InboxError) -> String {
    match err {
        InboxError::Api { status, body } => {
            let body = body.trim();
            if body.is_empty() {
                format!("HTTP {status}")
            } else {
                format!("HTTP {status}: {:.200}", body)
            }
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_guess_falls_back_to_octet_stream() {
        assert_eq!(guess_mime("/inbox/invoice.pdf"), "application/pdf");
        assert_eq!(guess_mime("/inbox/photo.jpg"), "image/jpeg");
        assert_eq!(guess_mime("/inbox/mystery.xyzzy"), "application/octet-stream");
    }

    #[test]
    fn unique_destination_numbers_collisions() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            unique_destination(dir.path(), Path::new("report.pdf")),
            dir.path().join("report.pdf")
        );

        std::fs::write(dir.path().join("report.pdf"), b"x").unwrap();
        assert_eq!(
            unique_destination(dir.path(), Path::new("report.pdf")),
            dir.path().join("report-1.pdf")
        );

        std::fs::write(dir.path().join("report-1.pdf"), b"x").unwrap();
        assert_eq!(
            unique_destination(dir.path(), Path::new("report.pdf")),
            dir.path().join("report-2.pdf")
        );
    }

    #[test]
    fn unique_destination_handles_extensionless_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README"), b"x").unwrap();
        assert_eq!(
            unique_destination(dir.path(), Path::new("README")),
            dir.path().join("README-1")
        );
    }

    #[test]
    fn api_errors_are_summarized_with_status() {
        let err = InboxError::Api {
            status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
            body: "  overloaded  ".into(),
        };
        assert_eq!(short_error(&err), "HTTP 503 Service Unavailable: overloaded");

        let bare = InboxError::Api {
            status: reqwest::StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        assert_eq!(short_error(&bare), "HTTP 502 Bad Gateway");
    }
}
