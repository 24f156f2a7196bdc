//! [`VcsClient`] over the `git` executable.
//!
//! Every invocation runs with `current_dir` set to the working-tree root and
//! is bounded by a timeout; a timed-out process is killed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::domain::{Result, SyncError};
use crate::vcs::{RepoStatus, VcsClient};

/// Output of a successful git invocation.
struct GitOutput {
    stdout: Vec<u8>,
}

/// Git client rooted at one working tree.
#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
    timeout: Duration,
}

impl GitCli {
    pub fn new(root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            root: root.into(),
            timeout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn run(&self, op: &'static str, args: &[&str]) -> Result<GitOutput> {
        trace!(op, ?args, "running git");
        let child = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SyncError::vcs(op, format!("failed to run git: {e}")))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                SyncError::vcs(op, format!("git {op} timed out after {:?}", self.timeout))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(SyncError::vcs(op, detail));
        }
        Ok(GitOutput {
            stdout: output.stdout,
        })
    }
}

#[async_trait]
impl VcsClient for GitCli {
    async fn is_repository(&self) -> Result<bool> {
        if !self.root.is_dir() {
            return Ok(false);
        }
        match self.run("rev-parse", &["rev-parse", "--is-inside-work-tree"]).await {
            Ok(out) => Ok(String::from_utf8_lossy(&out.stdout).trim() == "true"),
            Err(SyncError::Vcs { transient: false, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn status(&self) -> Result<RepoStatus> {
        let out = self
            .run(
                "status",
                &["status", "--porcelain=v1", "-z", "--untracked-files=all"],
            )
            .await?;
        Ok(parse_porcelain_z(&out.stdout))
    }

    async fn add(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "-A", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run("add", &args).await?;
        debug!(count = paths.len(), "staged paths");
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<String> {
        self.run("commit", &["commit", "-m", message]).await?;
        let out = self.run("rev-parse", &["rev-parse", "HEAD"]).await?;
        let sha = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if sha.is_empty() {
            return Err(SyncError::vcs("rev-parse", "git rev-parse HEAD returned empty output"));
        }
        Ok(sha)
    }

    async fn push(&self) -> Result<()> {
        self.run("push", &["push"]).await.map(|_| ())
    }

    async fn pull(&self) -> Result<()> {
        self.run("pull", &["pull", "--ff-only"]).await.map(|_| ())
    }
}

/// Parse `git status --porcelain=v1 -z` output.
///
/// Entries are `XY <path>\0`; renames and copies carry a second
/// `<orig-path>\0` which is skipped.
pub fn parse_porcelain_z(raw: &[u8]) -> RepoStatus {
    let mut status = RepoStatus::default();
    let mut entries = raw.split(|b| *b == 0).filter(|e| !e.is_empty());

    while let Some(entry) = entries.next() {
        if entry.len() < 4 {
            continue;
        }
        let (x, y) = (entry[0] as char, entry[1] as char);
        let path = String::from_utf8_lossy(&entry[3..]).into_owned();

        if matches!(x, 'R' | 'C') {
            entries.next();
        }

        if x == '?' && y == '?' {
            status.untracked.push(path);
            continue;
        }
        if x == '!' {
            continue;
        }
        if x != ' ' {
            status.staged.push(path.clone());
        }
        if y == 'D' {
            status.deleted.push(path.clone());
        }
        if matches!(y, 'M' | 'T' | 'U') {
            status.modified.push(path);
        }
    }
    status
}
