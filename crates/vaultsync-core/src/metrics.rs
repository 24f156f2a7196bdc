//! Per-pipeline atomic counters.
//!
//! Counters are incremented silently at the call site. Call
//! [`SyncMetrics::flush`] to emit current values as a single
//! `tracing::info!` event (the orchestrator does so on `stop()`).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Lightweight atomic counters, one set per orchestrator.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    batches_processed: AtomicU64,
    batches_failed: AtomicU64,
    files_rewritten: AtomicU64,
    files_staged: AtomicU64,
    files_failed: AtomicU64,
    commits: AtomicU64,
    push_failures: AtomicU64,
}

/// Plain copy of [`SyncMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub batches_processed: u64,
    pub batches_failed: u64,
    pub files_rewritten: u64,
    pub files_staged: u64,
    pub files_failed: u64,
    pub commits: u64,
    pub push_failures: u64,
}

impl SyncMetrics {
    pub const fn new() -> Self {
        Self {
            batches_processed: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            files_rewritten: AtomicU64::new(0),
            files_staged: AtomicU64::new(0),
            files_failed: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            push_failures: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64, name: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = name, "counter incremented");
    }

    pub fn inc_batches_processed(&self) {
        Self::bump(&self.batches_processed, "batches_processed");
    }

    pub fn inc_batches_failed(&self) {
        Self::bump(&self.batches_failed, "batches_failed");
    }

    /// A file whose content the normalizer rewrote.
    pub fn inc_files_rewritten(&self) {
        Self::bump(&self.files_rewritten, "files_rewritten");
    }

    pub fn inc_files_staged(&self) {
        Self::bump(&self.files_staged, "files_staged");
    }

    pub fn inc_files_failed(&self) {
        Self::bump(&self.files_failed, "files_failed");
    }

    pub fn inc_commits(&self) {
        Self::bump(&self.commits, "commits");
    }

    pub fn inc_push_failures(&self) {
        Self::bump(&self.push_failures, "push_failures");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            files_rewritten: self.files_rewritten.load(Ordering::Relaxed),
            files_staged: self.files_staged.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            push_failures: self.push_failures.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            batches_processed = s.batches_processed,
            batches_failed = s.batches_failed,
            files_rewritten = s.files_rewritten,
            files_staged = s.files_staged,
            files_failed = s.files_failed,
            commits = s.commits,
            push_failures = s.push_failures,
        );
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.batches_processed,
            &self.batches_failed,
            &self.files_rewritten,
            &self.files_staged,
            &self.files_failed,
            &self.commits,
            &self.push_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
