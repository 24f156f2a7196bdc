//! Batch-level records produced by the processor and the orchestrator.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A deduplicated set of paths collected in one aggregation window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBatch {
    pub id: Uuid,
    pub paths: Vec<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl ChangeBatch {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            paths,
            created_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// One file that could not be processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub file: String,
    pub error: String,
}

impl FileError {
    pub fn new(file: impl Into<String>, error: impl ToString) -> Self {
        Self {
            file: file.into(),
            error: error.to_string(),
        }
    }
}

/// Outcome of processing one batch. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProcessingResult {
    pub batch_id: Uuid,
    /// Files staged for commit (normalized, or already carrying changes).
    pub processed_files: Vec<String>,
    /// Files with nothing to commit.
    pub skipped_files: Vec<String>,
    pub errors: Vec<FileError>,
    /// Commit created for this batch, if any.
    pub commit_id: Option<String>,
    /// Push failure, reported without unwinding the commit.
    pub push_error: Option<String>,
    #[serde(with = "crate::config::serde_millis")]
    pub total_time: Duration,
    pub timestamp: DateTime<Utc>,
}

impl BatchProcessingResult {
    /// Total number of files the batch covered.
    pub fn file_count(&self) -> usize {
        self.processed_files.len() + self.skipped_files.len() + self.errors.len()
    }

    /// True when the batch had files and every one of them failed.
    pub fn all_failed(&self) -> bool {
        !self.errors.is_empty() && self.processed_files.is_empty() && self.skipped_files.is_empty()
    }
}

/// Result of an on-demand `sync_now` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub processed_files: Vec<String>,
    pub errors: Vec<FileError>,
    pub commit_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl From<BatchProcessingResult> for SyncResult {
    fn from(result: BatchProcessingResult) -> Self {
        Self {
            success: result.errors.is_empty() && result.push_error.is_none(),
            processed_files: result.processed_files,
            errors: result.errors,
            commit_id: result.commit_id,
            timestamp: result.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(processed: usize, skipped: usize, errors: usize) -> BatchProcessingResult {
        BatchProcessingResult {
            batch_id: Uuid::new_v4(),
            processed_files: (0..processed).map(|i| format!("p{i}.md")).collect(),
            skipped_files: (0..skipped).map(|i| format!("s{i}.md")).collect(),
            errors: (0..errors)
                .map(|i| FileError::new(format!("e{i}.md"), "boom"))
                .collect(),
            commit_id: None,
            push_error: None,
            total_time: Duration::from_millis(5),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn all_failed_only_when_nothing_else_happened() {
        assert!(result(0, 0, 2).all_failed());
        assert!(!result(1, 0, 2).all_failed());
        assert!(!result(0, 1, 2).all_failed());
        assert!(!result(0, 0, 0).all_failed());
    }

    #[test]
    fn sync_result_is_unsuccessful_with_errors_or_push_failure() {
        let ok: SyncResult = result(2, 1, 0).into();
        assert!(ok.success);
        assert_eq!(ok.processed_files.len(), 2);

        let with_errors: SyncResult = result(2, 0, 1).into();
        assert!(!with_errors.success);

        let mut pushed = result(1, 0, 0);
        pushed.push_error = Some("remote unreachable".into());
        let sync: SyncResult = pushed.into();
        assert!(!sync.success);
    }

    #[test]
    fn batch_result_serializes_total_time_as_millis() {
        let json = serde_json::to_value(result(1, 0, 0)).unwrap();
        assert_eq!(json["total_time"], 5);
    }
}
