//! Typed lifecycle events carried by the [`EventBus`](super::EventBus).

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription key for an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    SyncStarted,
    SyncStopped,
    SyncFailed,
    BatchStarted,
    BatchCompleted,
    BatchFailed,
    SystemError,
    Custom(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::SyncStarted => "sync.started",
            EventKind::SyncStopped => "sync.stopped",
            EventKind::SyncFailed => "sync.failed",
            EventKind::BatchStarted => "sync.batch.started",
            EventKind::BatchCompleted => "sync.batch.completed",
            EventKind::BatchFailed => "sync.batch.failed",
            EventKind::SystemError => "system.error",
            EventKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload schema, one variant per event kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    SyncStarted {
        root: PathBuf,
    },
    SyncStopped {
        total_processed: u64,
        /// Files still being processed when the drain timeout expired.
        in_flight: usize,
    },
    SyncFailed {
        consecutive_failures: u32,
        error: String,
    },
    BatchStarted {
        batch_id: Uuid,
        file_count: usize,
    },
    BatchCompleted {
        batch_id: Uuid,
        processed: usize,
        skipped: usize,
        errors: Vec<String>,
        commit_id: Option<String>,
        push_error: Option<String>,
        duration_ms: u64,
    },
    BatchFailed {
        batch_id: Uuid,
        file_count: usize,
        error: String,
        consecutive_failures: u32,
    },
    SystemError {
        /// Kind of the event whose handler failed.
        source_kind: String,
        handler: String,
        error: String,
    },
    Custom {
        name: String,
        data: serde_json::Value,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::SyncStarted { .. } => EventKind::SyncStarted,
            EventPayload::SyncStopped { .. } => EventKind::SyncStopped,
            EventPayload::SyncFailed { .. } => EventKind::SyncFailed,
            EventPayload::BatchStarted { .. } => EventKind::BatchStarted,
            EventPayload::BatchCompleted { .. } => EventKind::BatchCompleted,
            EventPayload::BatchFailed { .. } => EventKind::BatchFailed,
            EventPayload::SystemError { .. } => EventKind::SystemError,
            EventPayload::Custom { name, .. } => EventKind::Custom(name.clone()),
        }
    }
}

/// An immutable, timestamped event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            kind: payload.kind(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn custom(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new(EventPayload::Custom {
            name: name.into(),
            data,
        })
    }
}
