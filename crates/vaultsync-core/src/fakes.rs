//! In-memory fakes for the collaborator traits (testing only).
//!
//! Provides `MemoryVcs`, `ManualChangeSource`, `FnNormalizer` and
//! `FailingNormalizer`, which satisfy the trait contracts without touching
//! git or the file-system watcher.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::{FileChangeEvent, Result, SyncError};
use crate::normalize::{ContentNormalizer, NormalizeOptions, NormalizeOutcome};
use crate::source::ChangeSource;
use crate::vcs::{RepoStatus, VcsClient};

// ---------------------------------------------------------------------------
// MemoryVcs
// ---------------------------------------------------------------------------

/// A commit recorded by [`MemoryVcs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryCommit {
    pub id: String,
    pub message: String,
    pub files: Vec<String>,
}

#[derive(Debug, Default)]
struct VcsState {
    not_a_repository: bool,
    staged: BTreeSet<String>,
    modified: BTreeSet<String>,
    deleted: BTreeSet<String>,
    untracked: BTreeSet<String>,
    added: Vec<Vec<String>>,
    commits: Vec<MemoryCommit>,
    pushes: usize,
    pulls: usize,
    calls: HashMap<&'static str, usize>,
    queued: HashMap<&'static str, VecDeque<SyncError>>,
    persistent: HashMap<&'static str, String>,
}

impl VcsState {
    /// Count the call and return a scripted failure, if any.
    fn check(&mut self, op: &'static str) -> Result<()> {
        *self.calls.entry(op).or_default() += 1;
        if let Some(err) = self.queued.get_mut(op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        if let Some(message) = self.persistent.get(op) {
            return Err(SyncError::vcs(op, message.clone()));
        }
        Ok(())
    }
}

/// Scriptable in-memory working tree.
///
/// Operation names for scripting are `is_repository`, `status`, `add`,
/// `commit`, `push` and `pull`.
#[derive(Debug, Default)]
pub struct MemoryVcs {
    state: Mutex<VcsState>,
}

impl MemoryVcs {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VcsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_repository(&self, is_repository: bool) {
        self.lock().not_a_repository = !is_repository;
    }

    pub fn mark_dirty<I, S>(&self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock().modified.extend(paths.into_iter().map(Into::into));
    }

    pub fn mark_untracked<I, S>(&self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock().untracked.extend(paths.into_iter().map(Into::into));
    }

    pub fn mark_deleted<I, S>(&self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock().deleted.extend(paths.into_iter().map(Into::into));
    }

    /// Fail the next call of `op` with `err`. Queued errors are consumed in order.
    pub fn fail_next(&self, op: &'static str, err: SyncError) {
        self.lock().queued.entry(op).or_default().push_back(err);
    }

    /// Fail every call of `op` with a git error carrying `message` until cleared.
    pub fn fail_always(&self, op: &'static str, message: impl Into<String>) {
        self.lock().persistent.insert(op, message.into());
    }

    pub fn clear_failures(&self) {
        let mut st = self.lock();
        st.queued.clear();
        st.persistent.clear();
    }

    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// Arguments of every successful `add` call.
    pub fn added(&self) -> Vec<Vec<String>> {
        self.lock().added.clone()
    }

    pub fn commits(&self) -> Vec<MemoryCommit> {
        self.lock().commits.clone()
    }

    pub fn pushes(&self) -> usize {
        self.lock().pushes
    }

    pub fn pulls(&self) -> usize {
        self.lock().pulls
    }
}

#[async_trait]
impl VcsClient for MemoryVcs {
    async fn is_repository(&self) -> Result<bool> {
        let mut st = self.lock();
        st.check("is_repository")?;
        Ok(!st.not_a_repository)
    }

    async fn status(&self) -> Result<RepoStatus> {
        let mut st = self.lock();
        st.check("status")?;
        Ok(RepoStatus {
            staged: st.staged.iter().cloned().collect(),
            modified: st.modified.iter().cloned().collect(),
            deleted: st.deleted.iter().cloned().collect(),
            untracked: st.untracked.iter().cloned().collect(),
        })
    }

    async fn add(&self, paths: &[String]) -> Result<()> {
        let mut st = self.lock();
        st.check("add")?;
        for path in paths {
            let dirty = st.modified.remove(path)
                | st.untracked.remove(path)
                | st.deleted.remove(path);
            if dirty {
                st.staged.insert(path.clone());
            }
        }
        st.added.push(paths.to_vec());
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<String> {
        let mut st = self.lock();
        st.check("commit")?;
        if st.staged.is_empty() {
            return Err(SyncError::vcs(
                "commit",
                "nothing to commit, working tree clean",
            ));
        }
        let files: Vec<String> = std::mem::take(&mut st.staged).into_iter().collect();
        let id = format!("{:040x}", st.commits.len() + 1);
        st.commits.push(MemoryCommit {
            id: id.clone(),
            message: message.to_string(),
            files,
        });
        Ok(id)
    }

    async fn push(&self) -> Result<()> {
        let mut st = self.lock();
        st.check("push")?;
        st.pushes += 1;
        Ok(())
    }

    async fn pull(&self) -> Result<()> {
        let mut st = self.lock();
        st.check("pull")?;
        st.pulls += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ManualChangeSource
// ---------------------------------------------------------------------------

/// Change source driven by the test through [`emit`](Self::emit).
#[derive(Debug)]
pub struct ManualChangeSource {
    capacity: usize,
    sender: Mutex<Option<mpsc::Sender<FileChangeEvent>>>,
    subscriptions: AtomicUsize,
}

impl Default for ManualChangeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualChangeSource {
    pub fn new() -> Self {
        Self {
            capacity: 1024,
            sender: Mutex::new(None),
            subscriptions: AtomicUsize::new(0),
        }
    }

    fn current(&self) -> Option<mpsc::Sender<FileChangeEvent>> {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Deliver `event` to the current subscriber.
    pub async fn emit(&self, event: FileChangeEvent) -> Result<()> {
        let sender = self
            .current()
            .ok_or_else(|| SyncError::ChangeSource("no subscriber".into()))?;
        sender
            .send(event)
            .await
            .map_err(|_| SyncError::ChangeSource("subscriber dropped".into()))
    }

    /// Whether a live subscriber is attached.
    pub fn is_subscribed(&self) -> bool {
        self.current().is_some_and(|s| !s.is_closed())
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// End the stream for the current subscriber.
    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

#[async_trait]
impl ChangeSource for ManualChangeSource {
    async fn subscribe(&self) -> Result<mpsc::Receiver<FileChangeEvent>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        *self.sender.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Normalizers
// ---------------------------------------------------------------------------

/// Adapts a closure into a [`ContentNormalizer`].
pub struct FnNormalizer<F> {
    f: F,
}

impl<F> FnNormalizer<F>
where
    F: Fn(&str, &Path) -> Result<NormalizeOutcome> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ContentNormalizer for FnNormalizer<F>
where
    F: Fn(&str, &Path) -> Result<NormalizeOutcome> + Send + Sync,
{
    fn normalize(
        &self,
        raw: &str,
        path: &Path,
        _options: &NormalizeOptions,
    ) -> Result<NormalizeOutcome> {
        (self.f)(raw, path)
    }
}

/// Delegates to `inner` except for the configured paths, which fail with a
/// content error. Counts every call.
pub struct FailingNormalizer {
    inner: Arc<dyn ContentNormalizer>,
    failing: Vec<PathBuf>,
    calls: AtomicUsize,
}

impl FailingNormalizer {
    pub fn new<I, P>(inner: Arc<dyn ContentNormalizer>, failing: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            inner,
            failing: failing.into_iter().map(Into::into).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ContentNormalizer for FailingNormalizer {
    fn normalize(
        &self,
        raw: &str,
        path: &Path,
        options: &NormalizeOptions,
    ) -> Result<NormalizeOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.iter().any(|f| path.ends_with(f)) {
            return Err(SyncError::content(
                path.display().to_string(),
                "malformed content",
            ));
        }
        self.inner.normalize(raw, path, options)
    }
}
