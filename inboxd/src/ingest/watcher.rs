use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::{DEAD_LETTER_SUBFOLDER, UPLOADED_SUBFOLDER};

/// System and editor droppings that must never be uploaded.
const IGNORED_EXACT: &[&str] = &[
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    ".localized",
    "Icon\r",
];

const IGNORED_PREFIXES: &[&str] = &["~$", "._"];

const IGNORED_SUFFIXES: &[&str] = &[".tmp", ".swp", ".crdownload", ".part", ".partial"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub path: PathBuf,
    pub kind: RawEventKind,
}

/// Name-based ignore rules. User patterns are matched against the file
/// name: a leading `*` matches as suffix, a trailing `*` as prefix,
/// otherwise the pattern must match exactly.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    extra: Vec<String>,
}

impl IgnoreRules {
    pub fn new(extra: Vec<String>) -> Self {
        Self { extra }
    }

    pub fn matches(&self, path: &Path) -> bool {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return true;
        };

        if file_name.starts_with('.') {
            return true;
        }
        if IGNORED_EXACT.contains(&file_name) {
            return true;
        }
        if IGNORED_PREFIXES.iter().any(|p| file_name.starts_with(p)) {
            return true;
        }
        if IGNORED_SUFFIXES.iter().any(|s| file_name.ends_with(s)) {
            return true;
        }
        if path.components().any(|c| {
            c.as_os_str() == UPLOADED_SUBFOLDER || c.as_os_str() == DEAD_LETTER_SUBFOLDER
        }) {
            return true;
        }
        self.extra.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix('*') {
                file_name.ends_with(suffix)
            } else if let Some(prefix) = pattern.strip_suffix('*') {
                file_name.starts_with(prefix)
            } else {
                file_name == pattern
            }
        })
    }
}

/// Subscribes to filesystem notifications for the inbox folder and emits
/// filtered per-path events. The returned watcher handle must be kept
/// alive; dropping it tears down the subscription (and the channel), which
/// is how the daemon swaps folders atomically.
pub fn start_notify_watcher(
    root: &Path,
    rules: IgnoreRules,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<RawEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = root.to_path_buf();
    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for raw in map_event(event) {
                if accepts(&watch_root, &rules, &raw) {
                    let _ = tx.send(raw);
                }
            }
        }
    })?;
    watcher.watch(root.as_path(), RecursiveMode::NonRecursive)?;
    Ok((watcher, rx))
}

fn accepts(root: &Path, rules: &IgnoreRules, event: &RawEvent) -> bool {
    if event.path.parent() != Some(root) {
        return false;
    }
    if rules.matches(&event.path) {
        return false;
    }
    // Folders get their own Created events on some platforms.
    if event.kind != RawEventKind::Removed && event.path.is_dir() {
        return false;
    }
    true
}

fn map_event(event: Event) -> Vec<RawEvent> {
    match event.kind {
        EventKind::Modify(notify::event::ModifyKind::Name(rename)) => map_rename(rename, event.paths),
        EventKind::Create(_) => events_with_kind(event.paths, RawEventKind::Created),
        EventKind::Modify(_) => events_with_kind(event.paths, RawEventKind::Modified),
        EventKind::Remove(_) => events_with_kind(event.paths, RawEventKind::Removed),
        _ => Vec::new(),
    }
}

fn map_rename(rename: notify::event::RenameMode, paths: Vec<PathBuf>) -> Vec<RawEvent> {
    use notify::event::RenameMode;
    match rename {
        // A rename into the folder (or away from a temp name) is a new
        // arrival; the old name is gone.
        RenameMode::Both if paths.len() >= 2 => {
            let mut iter = paths.into_iter();
            if let (Some(from), Some(to)) = (iter.next(), iter.next()) {
                vec![
                    RawEvent {
                        path: from,
                        kind: RawEventKind::Removed,
                    },
                    RawEvent {
                        path: to,
                        kind: RawEventKind::Created,
                    },
                ]
            } else {
                Vec::new()
            }
        }
        RenameMode::From => events_with_kind(paths, RawEventKind::Removed),
        RenameMode::To => events_with_kind(paths, RawEventKind::Created),
        _ => events_with_kind(paths, RawEventKind::Modified),
    }
}

fn events_with_kind(paths: Vec<PathBuf>, kind: RawEventKind) -> Vec<RawEvent> {
    paths
        .into_iter()
        .map(|path| RawEvent { path, kind })
        .collect()
}

/// Lists non-ignored files already sitting in the folder, so documents
/// dropped while the agent was not running still get picked up.
pub fn scan_existing(root: &Path, rules: &IgnoreRules) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Ok(entries) = std::fs::read_dir(root) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !rules.matches(&path) && path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}
