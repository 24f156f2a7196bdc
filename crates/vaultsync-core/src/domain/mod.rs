//! Domain models for vaultsync.
//!
//! - `FileChangeEvent`: raw change notification from a change source
//! - `ChangeBatch`: deduplicated paths from one aggregation window
//! - `BatchProcessingResult` / `SyncResult`: per-batch outcomes
//! - `SyncStatus`: orchestrator status snapshot

pub mod batch;
pub mod change;
pub mod error;
pub mod status;

pub use batch::{BatchProcessingResult, ChangeBatch, FileError, SyncResult};
pub use change::{ChangeKind, FileChangeEvent};
pub use error::{Result, SyncError};
pub use status::SyncStatus;
