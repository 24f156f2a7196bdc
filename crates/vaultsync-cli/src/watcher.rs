//! File-system change source backed by `notify`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vaultsync_core::{ChangeKind, ChangeSource, FileChangeEvent, Result, SyncError};

/// Events buffered between the watcher thread and the aggregator.
const CHANNEL_CAPACITY: usize = 4096;

/// Watches `root` recursively. Each `subscribe` replaces the previous
/// watcher, whose stream then ends.
pub struct NotifyChangeSource {
    root: PathBuf,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl NotifyChangeSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            watcher: Mutex::new(None),
        }
    }

    /// Drop the active watcher, ending its event stream.
    pub fn stop(&self) {
        if self
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
        {
            debug!(root = %self.root.display(), "watcher stopped");
        }
    }
}

#[async_trait]
impl ChangeSource for NotifyChangeSource {
    async fn subscribe(&self) -> Result<mpsc::Receiver<FileChangeEvent>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<notify::Event>| match result {
                Ok(event) => {
                    for change in translate(&event) {
                        // Runs on the watcher's own thread, outside the runtime.
                        if tx.blocking_send(change).is_err() {
                            debug!("change receiver dropped");
                            return;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "file watcher error"),
            },
            Config::default(),
        )
        .map_err(|e| SyncError::ChangeSource(e.to_string()))?;
        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| SyncError::ChangeSource(format!("watch {}: {e}", self.root.display())))?;

        *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(watcher);
        debug!(root = %self.root.display(), "watching");
        Ok(rx)
    }
}

/// Map one `notify` event to change notifications, one per affected path.
pub fn translate(event: &notify::Event) -> Vec<FileChangeEvent> {
    use notify::EventKind;

    match event.kind {
        EventKind::Create(_) => paths_as(event, ChangeKind::Created),
        EventKind::Remove(_) => paths_as(event, ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths_as(event, ChangeKind::Deleted)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => paths_as(event, ChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
            [from, to] => vec![change(from, ChangeKind::Deleted), change(to, ChangeKind::Created)],
            _ => paths_as(event, ChangeKind::Modified),
        },
        EventKind::Modify(_) => paths_as(event, ChangeKind::Modified),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

fn paths_as(event: &notify::Event, kind: ChangeKind) -> Vec<FileChangeEvent> {
    event.paths.iter().map(|p| change(p, kind)).collect()
}

fn change(path: &Path, kind: ChangeKind) -> FileChangeEvent {
    let mut event = FileChangeEvent::new(path, kind);
    if kind != ChangeKind::Deleted {
        if let Ok(meta) = std::fs::metadata(path) {
            event.size_bytes = Some(meta.len());
            event.modified_at = meta.modified().ok().map(DateTime::<Utc>::from);
        }
    }
    event
}
