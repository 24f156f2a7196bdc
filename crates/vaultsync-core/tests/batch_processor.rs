//! Batch processor against a real directory and an in-memory repository.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use vaultsync_core::fakes::{FailingNormalizer, MemoryVcs};
use vaultsync_core::{
    BatchProcessor, ChangeBatch, CircuitBreaker, CircuitBreakerConfig, ContentNormalizer,
    MarkdownNormalizer, ProcessingSet, Resilience, RetryOptions, RetryPolicy, SyncConfig,
    SyncError, SyncMetrics,
};

struct Vault {
    dir: tempfile::TempDir,
    vcs: Arc<MemoryVcs>,
    metrics: Arc<SyncMetrics>,
    processing: Arc<ProcessingSet>,
    processor: BatchProcessor,
}

impl Vault {
    fn new(normalizer: Arc<dyn ContentNormalizer>) -> Self {
        Self::with_config(normalizer, |_| {})
    }

    fn with_config(normalizer: Arc<dyn ContentNormalizer>, tweak: impl FnOnce(&mut SyncConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::new(dir.path());
        config.retry = RetryOptions {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            exponential_base: 2.0,
            jitter: false,
        };
        tweak(&mut config);

        let resilience = Resilience::new(
            Arc::new(RetryPolicy::new(config.retry.clone()).unwrap()),
            Arc::new(CircuitBreaker::new("git", CircuitBreakerConfig::default()).unwrap()),
        );
        let vcs = Arc::new(MemoryVcs::new());
        let metrics = Arc::new(SyncMetrics::new());
        let processing = Arc::new(ProcessingSet::new());
        let processor = BatchProcessor::new(
            Arc::new(config),
            vcs.clone(),
            normalizer,
            resilience,
            Arc::clone(&processing),
            Arc::clone(&metrics),
        );
        Self {
            dir,
            vcs,
            metrics,
            processing,
            processor,
        }
    }

    /// Write a note with CRLF line endings and report it dirty to the repo.
    fn write_note(&self, name: &str) {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, format!("# {name}\r\nbody\r\n")).unwrap();
        self.vcs.mark_untracked([name]);
    }

    fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(name)).unwrap()
    }
}

fn markdown() -> Arc<dyn ContentNormalizer> {
    Arc::new(MarkdownNormalizer::new().unwrap())
}

fn names(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("note{i}.md")).collect()
}

#[tokio::test]
async fn one_bad_file_does_not_sink_the_batch() {
    let failing = Arc::new(FailingNormalizer::new(markdown(), ["note3.md"]));
    let vault = Vault::new(failing.clone());
    let files = names(5);
    for name in &files {
        vault.write_note(name);
    }

    let batch = ChangeBatch::new(files.iter().map(PathBuf::from).collect());
    let result = vault.processor.process(&batch).await.unwrap();

    assert_eq!(result.processed_files.len(), 4);
    assert!(!result.processed_files.contains(&"note3.md".to_string()));
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].file, "note3.md");
    assert!(!result.all_failed());

    let commits = vault.vcs.commits();
    assert_eq!(commits.len(), 1, "one commit per batch");
    assert_eq!(commits[0].files.len(), 4);
    assert_eq!(result.commit_id.as_deref(), Some(commits[0].id.as_str()));
    assert!(commits[0].message.contains("4 file(s)"));

    // The failing note keeps its original bytes.
    assert_eq!(vault.read("note3.md"), "# note3.md\r\nbody\r\n");
    assert_eq!(vault.read("note1.md"), "# note1.md\nbody\n");
    assert!(vault.processing.is_empty());

    let metrics = vault.metrics.snapshot();
    assert_eq!(metrics.files_rewritten, 4);
    assert_eq!(metrics.files_staged, 4);
    assert_eq!(metrics.files_failed, 1);
    assert_eq!(metrics.commits, 1);
}

#[tokio::test]
async fn second_pass_over_a_synced_batch_is_a_noop() {
    let vault = Vault::new(markdown());
    let files = names(3);
    for name in &files {
        vault.write_note(name);
    }
    let batch = ChangeBatch::new(files.iter().map(PathBuf::from).collect());
    let first = vault.processor.process(&batch).await.unwrap();
    assert_eq!(first.processed_files.len(), 3);
    let rewritten = vault.metrics.snapshot().files_rewritten;

    let again = ChangeBatch::new(files.iter().map(PathBuf::from).collect());
    let second = vault.processor.process(&again).await.unwrap();

    assert!(second.processed_files.is_empty());
    assert_eq!(second.skipped_files.len(), 3);
    assert!(second.errors.is_empty());
    assert!(second.commit_id.is_none());
    assert_eq!(vault.metrics.snapshot().files_rewritten, rewritten);
    assert_eq!(vault.vcs.commits().len(), 1);
}

#[tokio::test]
async fn nested_paths_are_reported_root_relative() {
    let vault = Vault::new(markdown());
    vault.write_note("daily/2024-01-01.md");

    let absolute = vault.dir.path().join("daily/2024-01-01.md");
    let result = vault
        .processor
        .process(&ChangeBatch::new(vec![absolute]))
        .await
        .unwrap();

    assert_eq!(result.processed_files, vec!["daily/2024-01-01.md"]);
    assert_eq!(vault.vcs.added(), vec![vec!["daily/2024-01-01.md".to_string()]]);
}

#[tokio::test]
async fn transient_stage_failure_is_retried() {
    let vault = Vault::new(markdown());
    vault.write_note("a.md");
    vault.vcs.fail_next(
        "add",
        SyncError::vcs("add", "fatal: Unable to create '.git/index.lock': File exists."),
    );

    let result = vault
        .processor
        .process(&ChangeBatch::new(vec![PathBuf::from("a.md")]))
        .await
        .unwrap();

    assert_eq!(result.processed_files, vec!["a.md"]);
    assert_eq!(vault.vcs.calls("add"), 2);
    assert_eq!(vault.processor.resilience().retry.stats().total_retries, 1);
}

#[tokio::test]
async fn permanent_stage_failure_is_a_file_error() {
    let vault = Vault::new(markdown());
    vault.write_note("a.md");
    vault.write_note("b.md");
    vault
        .vcs
        .fail_next("add", SyncError::vcs("add", "fatal: pathspec 'a.md' did not match"));

    let result = vault
        .processor
        .process(&ChangeBatch::new(vec![
            PathBuf::from("a.md"),
            PathBuf::from("b.md"),
        ]))
        .await
        .unwrap();

    assert_eq!(result.processed_files, vec!["b.md"]);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].file, "a.md");
    assert_eq!(vault.vcs.commits().len(), 1);
}

#[tokio::test]
async fn auto_commit_off_stages_without_committing() {
    let vault = Vault::with_config(markdown(), |c| c.auto_commit = false);
    vault.write_note("a.md");

    let result = vault
        .processor
        .process(&ChangeBatch::new(vec![PathBuf::from("a.md")]))
        .await
        .unwrap();

    assert_eq!(result.processed_files, vec!["a.md"]);
    assert!(result.commit_id.is_none());
    assert_eq!(vault.vcs.commits().len(), 0);
    assert_eq!(vault.vcs.added().len(), 1);
}

#[tokio::test]
async fn already_staged_file_is_not_staged_again() {
    let vault = Vault::with_config(markdown(), |c| c.auto_commit = false);
    vault.write_note("a.md");
    let batch = || ChangeBatch::new(vec![PathBuf::from("a.md")]);

    let first = vault.processor.process(&batch()).await.unwrap();
    assert_eq!(first.processed_files, vec!["a.md"]);

    let second = vault.processor.process(&batch()).await.unwrap();
    assert!(second.processed_files.is_empty());
    assert_eq!(second.skipped_files, vec!["a.md"]);
    assert_eq!(vault.vcs.added().len(), 1);
    assert_eq!(vault.metrics.snapshot().files_staged, 1);
}

#[tokio::test]
async fn auto_push_pushes_after_commit() {
    let vault = Vault::with_config(markdown(), |c| c.auto_push = true);
    vault.write_note("a.md");

    let result = vault
        .processor
        .process(&ChangeBatch::new(vec![PathBuf::from("a.md")]))
        .await
        .unwrap();

    assert!(result.commit_id.is_some());
    assert!(result.push_error.is_none());
    assert_eq!(vault.vcs.pushes(), 1);
}

#[tokio::test]
async fn status_failure_fails_the_whole_batch() {
    let vault = Vault::new(markdown());
    vault.write_note("a.md");
    vault.vcs.fail_always("status", "fatal: not a git repository");

    let err = vault
        .processor
        .process(&ChangeBatch::new(vec![PathBuf::from("a.md")]))
        .await
        .unwrap_err();

    assert!(matches!(err.root_cause(), SyncError::Vcs { op: "status", .. }));
    assert!(vault.processing.is_empty());
}
