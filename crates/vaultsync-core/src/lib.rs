//! vaultsync core library
//!
//! Keeps a directory of Markdown notes committed to git: change
//! notifications are debounced and batched, each batch is normalized and
//! committed (optionally pushed) under retry and circuit-breaker protection,
//! and lifecycle events are published on an in-process bus.

pub mod aggregator;
pub mod config;
pub mod domain;
pub mod events;
pub mod fakes;
pub mod git;
pub mod metrics;
pub mod normalize;
pub mod obs;
pub mod orchestrator;
pub mod processing_set;
pub mod processor;
pub mod resilience;
pub mod source;
pub mod telemetry;
pub mod vcs;

pub use aggregator::{AggregatorConfig, AggregatorStats, ChangeAggregator};
pub use config::{PathFilter, SyncConfig};
pub use domain::{
    BatchProcessingResult, ChangeBatch, ChangeKind, FileChangeEvent, FileError, Result,
    SyncError, SyncResult, SyncStatus,
};
pub use events::{Event, EventBus, EventHandler, EventKind, EventPayload, SubscriptionId};
pub use git::GitCli;
pub use metrics::{MetricsSnapshot, SyncMetrics};
pub use normalize::{ContentNormalizer, MarkdownNormalizer, NormalizeOptions, NormalizeOutcome};
pub use orchestrator::{SyncOrchestrator, SyncOrchestratorBuilder};
pub use processing_set::ProcessingSet;
pub use processor::BatchProcessor;
pub use resilience::{
    with_resilience, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
    Resilience, RetryOptions, RetryPolicy, RetryStats,
};
pub use source::ChangeSource;
pub use telemetry::init_tracing;
pub use vcs::{RepoStatus, VcsClient};

/// Crate version, kept in step with the workspace.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
