//! Raw change notifications as delivered by a change source.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// A single change notification for one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeEvent {
    pub path: PathBuf,
    pub change_kind: ChangeKind,
    pub timestamp: DateTime<Utc>,
    pub size_bytes: Option<u64>,
    pub modified_at: Option<DateTime<Utc>>,
}

impl FileChangeEvent {
    pub fn new(path: impl Into<PathBuf>, change_kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            change_kind,
            timestamp: Utc::now(),
            size_bytes: None,
            modified_at: None,
        }
    }

    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ChangeKind::Created)
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ChangeKind::Modified)
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ChangeKind::Deleted)
    }

    /// Override the detection timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
