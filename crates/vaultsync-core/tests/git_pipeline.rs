//! End to end against a real git repository in a temp dir.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use vaultsync_core::fakes::ManualChangeSource;
use vaultsync_core::{EventKind, EventPayload, FileChangeEvent, SyncConfig, SyncOrchestrator};

fn git(repo_dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn make_vault() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    git(dir.path(), &["init"]);
    git(dir.path(), &["config", "user.name", "test-user"]);
    git(dir.path(), &["config", "user.email", "test@example.com"]);
    git(dir.path(), &["config", "commit.gpgsign", "false"]);
    git(dir.path(), &["commit", "--allow-empty", "-m", "initial"]);
    dir
}

fn orchestrator(root: &Path, source: Arc<ManualChangeSource>) -> SyncOrchestrator {
    let mut config = SyncConfig::new(root);
    config.debounce = Duration::from_millis(20);
    config.batch_window = Duration::from_millis(100);
    SyncOrchestrator::builder()
        .config(config)
        .change_source(source)
        .build()
        .unwrap()
}

#[tokio::test]
async fn sync_now_normalizes_and_commits_with_git() {
    let vault = make_vault();
    std::fs::create_dir_all(vault.path().join("daily")).unwrap();
    std::fs::write(vault.path().join("daily/monday.md"), "# Monday   \r\nstandup\r\n").unwrap();
    std::fs::write(vault.path().join("scratch.txt"), "not a note\n").unwrap();

    let orch = orchestrator(vault.path(), Arc::new(ManualChangeSource::new()));
    let result = orch.sync_now().await.unwrap();

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.processed_files, vec!["daily/monday.md"]);
    let head = git(vault.path(), &["rev-parse", "HEAD"]);
    assert_eq!(result.commit_id.as_deref(), Some(head.trim()));

    let committed = git(vault.path(), &["show", "HEAD:daily/monday.md"]);
    assert!(!committed.contains('\r'));
    let log = git(vault.path(), &["log", "-1", "--format=%B"]);
    assert!(log.contains("- daily/monday.md"));

    // The non-note file is left alone.
    let status = git(vault.path(), &["status", "--porcelain"]);
    assert!(status.contains("scratch.txt"));
    assert!(!status.contains("monday.md"));

    // Nothing left to do on a second run.
    let again = orch.sync_now().await.unwrap();
    assert!(again.processed_files.is_empty());
    assert!(again.commit_id.is_none());
}

#[tokio::test]
async fn pipeline_commits_watched_changes() {
    let vault = make_vault();
    let source = Arc::new(ManualChangeSource::new());
    let orch = orchestrator(vault.path(), source.clone());

    orch.start().await.unwrap();
    std::fs::write(vault.path().join("idea.md"), "an idea\n").unwrap();
    source
        .emit(FileChangeEvent::created(vault.path().join("idea.md")))
        .await
        .unwrap();

    let event = orch
        .event_bus()
        .wait_for(EventKind::BatchCompleted, Some(Duration::from_secs(10)))
        .await
        .unwrap();
    let EventPayload::BatchCompleted {
        processed,
        commit_id,
        ..
    } = event.payload
    else {
        panic!("unexpected payload");
    };
    assert_eq!(processed, 1);
    let head = git(vault.path(), &["rev-parse", "HEAD"]);
    assert_eq!(commit_id.as_deref(), Some(head.trim()));

    orch.stop().await.unwrap();
    assert!(git(vault.path(), &["status", "--porcelain"]).is_empty());
}

#[tokio::test]
async fn start_refuses_plain_directory() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path(), Arc::new(ManualChangeSource::new()));
    assert!(orch.start().await.is_err());
    assert!(!orch.get_status().is_running);
}
