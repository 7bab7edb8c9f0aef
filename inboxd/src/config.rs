use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

const DEFAULT_INBOX_DIR_NAME: &str = "Document Inbox";
const CONFIG_DIR_NAME: &str = "inbox-agent";
const CONFIG_FILE_NAME: &str = "config.json";

/// Subfolder (inside the inbox) that uploaded files are moved into.
pub const UPLOADED_SUBFOLDER: &str = "Subidos";
/// Dead-letter subfolder for files that exhausted retries or were rejected.
pub const DEAD_LETTER_SUBFOLDER: &str = "Fallidos";

const DEFAULT_UPLOAD_CONCURRENCY: usize = 1;
const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_QUIET_INTERVAL_MS: u64 = 2_000;
const DEFAULT_PROBE_INTERVAL_SECS: u64 = 15;
const DEFAULT_IDLE_INTERVAL_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("XDG config directory is unavailable")]
    MissingConfigDir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostUploadAction {
    Delete,
    MoveToSubfolder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub server_url: String,
    pub inbox_dir: PathBuf,
    pub post_upload: PostUploadAction,
    #[serde(default)]
    pub extra_ignores: Vec<String>,
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_quiet_interval_ms")]
    pub quiet_interval_ms: u64,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
}

fn default_upload_concurrency() -> usize {
    DEFAULT_UPLOAD_CONCURRENCY
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_quiet_interval_ms() -> u64 {
    DEFAULT_QUIET_INTERVAL_MS
}

fn default_probe_interval_secs() -> u64 {
    DEFAULT_PROBE_INTERVAL_SECS
}

fn default_idle_interval_ms() -> u64 {
    DEFAULT_IDLE_INTERVAL_MS
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            inbox_dir: default_inbox_dir(),
            post_upload: PostUploadAction::Delete,
            extra_ignores: Vec::new(),
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            quiet_interval_ms: DEFAULT_QUIET_INTERVAL_MS,
            probe_interval_secs: DEFAULT_PROBE_INTERVAL_SECS,
            idle_interval_ms: DEFAULT_IDLE_INTERVAL_MS,
        }
    }
}

impl AgentConfig {
    pub fn quiet_interval(&self) -> Duration {
        Duration::from_millis(self.quiet_interval_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn uploaded_dir(&self) -> PathBuf {
        self.inbox_dir.join(UPLOADED_SUBFOLDER)
    }

    pub fn dead_letter_dir(&self) -> PathBuf {
        self.inbox_dir.join(DEAD_LETTER_SUBFOLDER)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("INBOX_SERVER_URL") {
            self.server_url = url;
        }
        if let Ok(dir) = std::env::var("INBOX_DIR") {
            self.inbox_dir = PathBuf::from(dir);
        }
        self.upload_concurrency = read_usize_env("INBOX_UPLOAD_CONCURRENCY", self.upload_concurrency);
        self.max_attempts = read_u64_env("INBOX_MAX_ATTEMPTS", u64::from(self.max_attempts)) as u32;
        self.quiet_interval_ms = read_u64_env("INBOX_QUIET_INTERVAL_MS", self.quiet_interval_ms);
        self.probe_interval_secs = read_u64_env("INBOX_PROBE_INTERVAL_SECS", self.probe_interval_secs);
        self.idle_interval_ms = read_u64_env("INBOX_IDLE_INTERVAL_MS", self.idle_interval_ms);
    }
}

fn default_inbox_dir() -> PathBuf {
    dirs::document_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_INBOX_DIR_NAME)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_usize_env(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

/// Owns the persisted configuration. `get` hands out snapshots; `save`
/// rewrites the file atomically and notifies subscribers so the daemon can
/// re-subscribe the watcher when the inbox folder moves.
pub struct ConfigStore {
    path: PathBuf,
    tx: watch::Sender<AgentConfig>,
}

impl ConfigStore {
    pub fn load_default() -> Result<Self, ConfigError> {
        let dir = dirs::config_dir().ok_or(ConfigError::MissingConfigDir)?;
        Self::load_from(dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content).unwrap_or_default()
        } else {
            AgentConfig::default()
        };
        config.apply_env_overrides();
        let (tx, _) = watch::channel(config);
        Ok(Self { path, tx })
    }

    pub fn get(&self) -> AgentConfig {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentConfig> {
        self.tx.subscribe()
    }

    pub fn save(&self, config: AgentConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&config)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        let _ = self.tx.send(config);
        Ok(())
    }

    /// Creates the inbox folder if the user has not made it yet.
    pub fn ensure_inbox_dir(&self) -> Result<PathBuf, ConfigError> {
        let dir = self.get().inbox_dir;
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(dir)
    }
}

pub fn uploaded_subfolder(inbox_dir: &Path) -> PathBuf {
    inbox_dir.join(UPLOADED_SUBFOLDER)
}

pub fn dead_letter_subfolder(inbox_dir: &Path) -> PathBuf {
    inbox_dir.join(DEAD_LETTER_SUBFOLDER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::load_from(path.clone()).unwrap();

        let mut config = store.get();
        config.server_url = "https://inbox.example.com".into();
        config.post_upload = PostUploadAction::MoveToSubfolder;
        store.save(config.clone()).unwrap();

        let reloaded = ConfigStore::load_from(path).unwrap();
        assert_eq!(reloaded.get().server_url, "https://inbox.example.com");
        assert_eq!(reloaded.get().post_upload, PostUploadAction::MoveToSubfolder);
    }

    #[test]
    fn save_notifies_subscribers() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::load_from(dir.path().join("config.json")).unwrap();
        let mut rx = store.subscribe();

        let mut config = store.get();
        config.inbox_dir = dir.path().join("elsewhere");
        store.save(config.clone()).unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().inbox_dir, config.inbox_dir);
    }

    #[test]
    fn corrupt_config_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = ConfigStore::load_from(path).unwrap();
        assert_eq!(store.get().max_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn subfolders_live_inside_the_inbox() {
        let config = AgentConfig {
            inbox_dir: PathBuf::from("/home/ana/Inbox"),
            ..AgentConfig::default()
        };
        assert_eq!(config.uploaded_dir(), PathBuf::from("/home/ana/Inbox/Subidos"));
        assert_eq!(
            config.dead_letter_dir(),
            PathBuf::from("/home/ana/Inbox/Fallidos")
        );
    }
}
