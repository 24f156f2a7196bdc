//! Structured observability hooks for the sync pipeline.
//!
//! This module provides:
//! - Batch-scoped tracing spans via [`batch_span`], attached with `Instrument`
//! - Emission functions for batch start/finish, critical shutdown, circuit
//!   transitions and event-handler failures
//!
//! Events are emitted with an `event` field so log pipelines can filter on it.
//! Verbosity is controlled by `VAULTSYNC_LOG` (see [`crate::telemetry`]).

use tracing::{error, info, warn};
use uuid::Uuid;

/// Span tagging every log line of one batch with its id.
///
/// ```ignore
/// processor.process(&batch).instrument(obs::batch_span(batch.id)).await
/// ```
pub fn batch_span(batch_id: Uuid) -> tracing::Span {
    tracing::info_span!("vaultsync.batch", batch_id = %batch_id)
}

pub fn emit_sync_started(root: &std::path::Path) {
    info!(event = "sync.started", root = %root.display());
}

pub fn emit_sync_stopped(total_processed: u64, in_flight: usize) {
    info!(event = "sync.stopped", total_processed, in_flight);
}

pub fn emit_batch_started(batch_id: Uuid, file_count: usize) {
    info!(event = "batch.started", batch_id = %batch_id, file_count);
}

/// Emit event: batch finished, with per-outcome counts.
pub fn emit_batch_finished(
    batch_id: Uuid,
    processed: usize,
    skipped: usize,
    errors: usize,
    duration_ms: u64,
    success: bool,
) {
    info!(
        event = "batch.finished",
        batch_id = %batch_id,
        processed,
        skipped,
        errors,
        duration_ms,
        success,
    );
}

pub fn emit_batch_failed(batch_id: Uuid, consecutive_failures: u32, error: &dyn std::fmt::Display) {
    warn!(
        event = "batch.failed",
        batch_id = %batch_id,
        consecutive_failures,
        error = %error,
    );
}

/// Emit event: the pipeline parked itself after too many failed batches.
pub fn emit_critical_shutdown(consecutive_failures: u32, error: &str) {
    error!(event = "sync.critical_shutdown", consecutive_failures, error = %error);
}

pub fn emit_circuit_transition(name: &str, from: &str, to: &str, failure_count: u32) {
    if to == "open" {
        warn!(event = "circuit.transition", breaker = %name, from, to, failure_count);
    } else {
        info!(event = "circuit.transition", breaker = %name, from, to, failure_count);
    }
}

pub fn emit_handler_failed(kind: &str, handler: &str, error: &str) {
    warn!(event = "handler.failed", kind = %kind, handler = %handler, error = %error);
}
