//! Batch processing: normalize, stage, commit, push.
//!
//! Per batch:
//! 1. Every file is read, normalized and, when the normalizer changed it,
//!    rewritten atomically. Local I/O is retried on transient errors; a
//!    failing file lands in the batch's error list and the rest continue.
//! 2. Under the repository lock, a status snapshot decides which files carry
//!    changes. Those are staged one by one (each under retry + circuit
//!    breaker); clean files are reported as skipped.
//! 3. One commit covers everything staged, optionally followed by a push.
//!    A push failure is reported but does not unwind the commit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::domain::{BatchProcessingResult, ChangeBatch, FileError, Result, SyncError};
use crate::metrics::SyncMetrics;
use crate::normalize::ContentNormalizer;
use crate::processing_set::{Claim, ProcessingSet};
use crate::resilience::Resilience;
use crate::vcs::VcsClient;

/// What happened to one file in the first phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prepared {
    Rewritten,
    Unchanged,
    Missing,
}

pub struct BatchProcessor {
    config: Arc<SyncConfig>,
    vcs: Arc<dyn VcsClient>,
    normalizer: Arc<dyn ContentNormalizer>,
    resilience: Resilience,
    processing: Arc<ProcessingSet>,
    repo_lock: Arc<Mutex<()>>,
    metrics: Arc<SyncMetrics>,
}

impl BatchProcessor {
    pub fn new(
        config: Arc<SyncConfig>,
        vcs: Arc<dyn VcsClient>,
        normalizer: Arc<dyn ContentNormalizer>,
        resilience: Resilience,
        processing: Arc<ProcessingSet>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            config,
            vcs,
            normalizer,
            resilience,
            processing,
            repo_lock: Arc::new(Mutex::new(())),
            metrics,
        }
    }

    pub fn resilience(&self) -> &Resilience {
        &self.resilience
    }

    /// Process `batch`, claiming its paths first. Paths another batch is
    /// still handling are reported as skipped.
    pub async fn process(&self, batch: &ChangeBatch) -> Result<BatchProcessingResult> {
        let mut claimed = Vec::with_capacity(batch.len());
        let mut busy = Vec::new();
        for path in &batch.paths {
            if self.processing.try_claim(std::slice::from_ref(path)).is_empty() {
                claimed.push(path.clone());
            } else {
                busy.push(self.display_path(path));
            }
        }
        if !busy.is_empty() {
            debug!(count = busy.len(), "skipping paths already in flight");
        }

        let owned = ChangeBatch {
            id: batch.id,
            paths: claimed,
            created_at: batch.created_at,
        };
        let mut result = self.process_claimed(&owned).await?;
        result.skipped_files.extend(busy);
        Ok(result)
    }

    /// Process a batch whose paths the caller already claimed. The claims
    /// are released when this returns, on every path.
    pub async fn process_claimed(&self, batch: &ChangeBatch) -> Result<BatchProcessingResult> {
        let _claim = Claim::adopt(&self.processing, batch.paths.clone());
        let started = Instant::now();

        let mut errors = Vec::new();
        let mut prepared = Vec::with_capacity(batch.len());
        for path in &batch.paths {
            let rel = self.display_path(path);
            match self.prepare_file(path, &rel).await {
                Ok(state) => prepared.push((rel, state)),
                Err(err) => {
                    self.record_file_error(&rel, &err);
                    errors.push(FileError::new(rel, err.root_cause()));
                }
            }
        }

        let mut processed = Vec::new();
        let mut skipped = Vec::new();
        let mut commit_id = None;
        let mut push_error = None;

        if !prepared.is_empty() {
            let _repo = self.repo_lock.lock().await;
            let status = self
                .resilience
                .run("vcs.status", || self.vcs.status())
                .await?;

            for (rel, state) in prepared {
                if !status.has_unstaged_change(&rel) {
                    debug!(path = %rel, ?state, "nothing to stage");
                    skipped.push(rel);
                    continue;
                }
                let paths = std::slice::from_ref(&rel);
                match self.resilience.run("vcs.add", || self.vcs.add(paths)).await {
                    Ok(()) => {
                        self.metrics.inc_files_staged();
                        processed.push(rel);
                    }
                    Err(err) => {
                        self.record_file_error(&rel, &err);
                        errors.push(FileError::new(rel, err.root_cause()));
                    }
                }
            }

            if !processed.is_empty() && self.config.auto_commit {
                let message = self.config.render_commit_message(&processed, Utc::now());
                let id = self
                    .resilience
                    .run("vcs.commit", || self.vcs.commit(&message))
                    .await?;
                self.metrics.inc_commits();
                info!(commit = %id, files = processed.len(), "batch committed");
                commit_id = Some(id);

                if self.config.auto_push {
                    if let Err(err) = self.resilience.run("vcs.push", || self.vcs.push()).await {
                        warn!(error = %err, "push failed; commit kept locally");
                        self.metrics.inc_push_failures();
                        push_error = Some(err.to_string());
                    }
                }
            }
        }

        Ok(BatchProcessingResult {
            batch_id: batch.id,
            processed_files: processed,
            skipped_files: skipped,
            errors,
            commit_id,
            push_error,
            total_time: started.elapsed(),
            timestamp: Utc::now(),
        })
    }

    /// Fast-forward from the remote under the repository lock.
    pub async fn pull(&self) -> Result<()> {
        let _repo = self.repo_lock.lock().await;
        self.resilience.run("vcs.pull", || self.vcs.pull()).await
    }

    async fn prepare_file(&self, path: &Path, rel: &str) -> Result<Prepared> {
        let abs = self.config.root.join(path);
        if !tokio::fs::try_exists(&abs).await? {
            return Ok(Prepared::Missing);
        }
        let context = format!("normalize {rel}");
        let rewritten = self
            .resilience
            .retry
            .execute_with_custom_retry(
                &context,
                || self.rewrite(&abs, path, rel),
                |err, _| err.is_transient(),
            )
            .await?;
        Ok(if rewritten {
            Prepared::Rewritten
        } else {
            Prepared::Unchanged
        })
    }

    /// Normalize one file in place. Returns whether it was rewritten.
    async fn rewrite(&self, abs: &Path, path: &Path, rel: &str) -> Result<bool> {
        let raw = tokio::fs::read_to_string(abs).await?;
        let outcome = self
            .normalizer
            .normalize(&raw, path, &self.config.normalize)?;
        if !outcome.errors.is_empty() {
            return Err(SyncError::content(rel, outcome.errors.join("; ")));
        }
        for warning in &outcome.warnings {
            debug!(path = %rel, warning = %warning, "normalizer warning");
        }
        if !outcome.modified || outcome.content == raw {
            return Ok(false);
        }
        write_atomic(abs, outcome.content.as_bytes()).await?;
        self.metrics.inc_files_rewritten();
        debug!(path = %rel, "normalized");
        Ok(true)
    }

    fn record_file_error(&self, rel: &str, err: &SyncError) {
        self.metrics.inc_files_failed();
        warn!(path = %rel, error = %err, "file failed");
    }

    /// Root-relative, `/`-separated form used in results and VCS calls.
    fn display_path(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.config.root).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Write via a sibling temp file and rename, so readers never see a
/// half-written note.
async fn write_atomic(target: &Path, contents: &[u8]) -> Result<()> {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp: PathBuf = target.with_file_name(format!(".{file_name}.vaultsync.tmp"));
    if let Err(err) = tokio::fs::write(&tmp, contents).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    if let Err(err) = tokio::fs::rename(&tmp, target).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    Ok(())
}
