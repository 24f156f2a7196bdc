//! Orchestrator status snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time copy of the orchestrator's status.
///
/// Callers always receive an owned clone; mutating it has no effect on the
/// orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_running: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub total_processed: u64,
    pub error_count: u64,
    pub consecutive_failures: u32,
}
