//! Error taxonomy for vaultsync.

use std::path::PathBuf;

/// Substrings in git stderr that indicate a condition worth retrying.
const TRANSIENT_MARKERS: &[&str] = &[
    "index.lock",
    "unable to create",
    "could not resolve host",
    "connection refused",
    "connection reset",
    "connection timed out",
    "operation timed out",
    "timed out",
    "could not read from remote repository",
    "the remote end hung up",
    "temporary failure",
    "early eof",
    "resource temporarily unavailable",
];

/// vaultsync errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("not a git repository: {}", .0.display())]
    NotARepository(PathBuf),

    #[error("git {op} failed: {message}")]
    Vcs {
        op: &'static str,
        message: String,
        transient: bool,
    },

    #[error("content error in {path}: {message}")]
    Content { path: String, message: String },

    #[error("circuit '{name}' is open; call rejected")]
    CircuitOpen { name: String },

    #[error("{context} failed after {attempts} attempt(s): {last}")]
    RetryExhausted {
        context: String,
        attempts: u32,
        #[source]
        last: Box<SyncError>,
    },

    #[error("{0} has been disposed")]
    Disposed(&'static str),

    #[error("timed out waiting for event '{kind}'")]
    Timeout { kind: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("change source error: {0}")]
    ChangeSource(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Build a git error, classifying it as transient from its stderr text.
    pub fn vcs(op: &'static str, message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        let transient = TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m));
        SyncError::Vcs {
            op,
            message,
            transient,
        }
    }

    pub fn content(path: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Content {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the failed operation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Vcs { transient, .. } => *transient,
            SyncError::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::InvalidData
                    | std::io::ErrorKind::InvalidInput
                    | std::io::ErrorKind::Unsupported
            ),
            SyncError::RetryExhausted { .. }
            | SyncError::NotARepository(_)
            | SyncError::Content { .. }
            | SyncError::CircuitOpen { .. }
            | SyncError::Disposed(_)
            | SyncError::Timeout { .. }
            | SyncError::InvalidConfig(_)
            | SyncError::MissingField(_)
            | SyncError::ChangeSource(_)
            | SyncError::Serialization(_) => false,
        }
    }

    /// The innermost cause, looking through retry wrapping.
    pub fn root_cause(&self) -> &SyncError {
        match self {
            SyncError::RetryExhausted { last, .. } => last.root_cause(),
            other => other,
        }
    }
}

/// Result type for vaultsync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
