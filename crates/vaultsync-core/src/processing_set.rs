//! Paths currently being processed.
//!
//! Shared by the aggregator (which skips claimed paths) and the processor
//! (which claims on entry and releases on completion). A claim is atomic
//! across all requested paths, so no two batches hold the same path.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct ProcessingSet {
    paths: Mutex<HashSet<PathBuf>>,
    emptied: Notify,
}

impl ProcessingSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.paths.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim every path in `paths`, or none of them.
    ///
    /// Returns the paths that were already claimed (empty on success).
    pub fn try_claim(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        let mut set = self.lock();
        let busy: Vec<PathBuf> = paths.iter().filter(|p| set.contains(*p)).cloned().collect();
        if busy.is_empty() {
            set.extend(paths.iter().cloned());
        }
        busy
    }

    pub fn release(&self, paths: &[PathBuf]) {
        let mut set = self.lock();
        for path in paths {
            set.remove(path);
        }
        if set.is_empty() {
            self.emptied.notify_waiters();
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().contains(path)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait until no path is claimed. Returns the number still in flight when
    /// `timeout` expired (0 when the set drained).
    pub async fn wait_until_empty(&self, timeout: Duration) -> usize {
        let wait = async {
            loop {
                let notified = self.emptied.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => 0,
            Err(_) => self.len(),
        }
    }
}

/// Releases its paths when dropped.
pub struct Claim<'a> {
    set: &'a ProcessingSet,
    paths: Vec<PathBuf>,
}

impl<'a> Claim<'a> {
    /// Claim `paths` in `set`, or return the paths that were busy.
    pub fn acquire(set: &'a ProcessingSet, paths: Vec<PathBuf>) -> Result<Self, Vec<PathBuf>> {
        let busy = set.try_claim(&paths);
        if busy.is_empty() {
            Ok(Self { set, paths })
        } else {
            Err(busy)
        }
    }

    /// Take ownership of paths that were already claimed elsewhere.
    pub fn adopt(set: &'a ProcessingSet, paths: Vec<PathBuf>) -> Self {
        Self { set, paths }
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.set.release(&self.paths);
    }
}
