//! The synchronization orchestrator.
//!
//! Owns one pipeline: change source -> [`ChangeAggregator`] -> worker ->
//! [`BatchProcessor`]. Lifecycle is `Stopped -> Running -> Stopped`.
//!
//! Two failure counters are layered on the same git operations: the circuit
//! breaker counts individual call failures and sheds load for
//! `recovery_time`; the orchestrator counts consecutive *failed batches* and,
//! at `max_consecutive_failures`, parks the pipeline until `start()` is called
//! again. A batch that fails because the circuit is open counts towards the
//! orchestrator ceiling.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::aggregator::{AggregatorConfig, AggregatorStats, ChangeAggregator};
use crate::config::SyncConfig;
use crate::domain::{
    BatchProcessingResult, ChangeBatch, FileChangeEvent, Result, SyncError, SyncResult,
    SyncStatus,
};
use crate::events::{Event, EventBus, EventPayload};
use crate::git::GitCli;
use crate::metrics::{MetricsSnapshot, SyncMetrics};
use crate::normalize::{ContentNormalizer, MarkdownNormalizer};
use crate::obs;
use crate::processing_set::ProcessingSet;
use crate::processor::BatchProcessor;
use crate::resilience::{CircuitBreaker, CircuitBreakerStats, Resilience, RetryPolicy, RetryStats};
use crate::source::ChangeSource;
use crate::vcs::VcsClient;

/// Builder for [`SyncOrchestrator`]. `build()` validates everything up front.
#[derive(Default)]
pub struct SyncOrchestratorBuilder {
    config: Option<SyncConfig>,
    source: Option<Arc<dyn ChangeSource>>,
    vcs: Option<Arc<dyn VcsClient>>,
    normalizer: Option<Arc<dyn ContentNormalizer>>,
    event_bus: Option<Arc<EventBus>>,
}

impl SyncOrchestratorBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn change_source(mut self, source: Arc<dyn ChangeSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Defaults to [`GitCli`] rooted at `config.root`.
    pub fn vcs(mut self, vcs: Arc<dyn VcsClient>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    /// Defaults to [`MarkdownNormalizer`].
    pub fn normalizer(mut self, normalizer: Arc<dyn ContentNormalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    /// Share an existing bus; by default each orchestrator gets its own.
    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn build(self) -> Result<SyncOrchestrator> {
        let config = self.config.ok_or(SyncError::MissingField("config"))?;
        config.validate()?;
        let source = self.source.ok_or(SyncError::MissingField("change_source"))?;
        let config = Arc::new(config);

        let vcs = match self.vcs {
            Some(vcs) => vcs,
            None => Arc::new(GitCli::new(config.root.clone(), config.git_timeout)),
        };
        let normalizer = match self.normalizer {
            Some(normalizer) => normalizer,
            None => Arc::new(MarkdownNormalizer::new()?),
        };
        let bus = self
            .event_bus
            .unwrap_or_else(|| Arc::new(EventBus::with_history_capacity(config.event_history_capacity)));

        let resilience = Resilience::new(
            Arc::new(RetryPolicy::new(config.retry.clone())?),
            Arc::new(CircuitBreaker::new("git", config.circuit_breaker.clone())?),
        );
        let processing = Arc::new(ProcessingSet::new());
        let metrics = Arc::new(SyncMetrics::new());
        let processor = Arc::new(BatchProcessor::new(
            Arc::clone(&config),
            Arc::clone(&vcs),
            normalizer,
            resilience.clone(),
            Arc::clone(&processing),
            Arc::clone(&metrics),
        ));

        Ok(SyncOrchestrator {
            config,
            source,
            vcs,
            bus,
            resilience,
            processor,
            processing,
            metrics,
            shared: Arc::new(Shared::default()),
            pipeline: tokio::sync::Mutex::new(None),
            maintenance: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }
}

/// State shared with the worker task.
#[derive(Default)]
struct Shared {
    status: Mutex<SyncStatus>,
    /// Bumped on every start; lets a stale worker recognise it was replaced.
    generation: AtomicU64,
}

impl Shared {
    fn update<R>(&self, f: impl FnOnce(&mut SyncStatus) -> R) -> R {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut status)
    }

    fn snapshot(&self) -> SyncStatus {
        self.update(|s| s.clone())
    }
}

struct Pipeline {
    shutdown: Arc<watch::Sender<bool>>,
    aggregator: JoinHandle<AggregatorStats>,
    worker: JoinHandle<()>,
}

pub struct SyncOrchestrator {
    config: Arc<SyncConfig>,
    source: Arc<dyn ChangeSource>,
    vcs: Arc<dyn VcsClient>,
    bus: Arc<EventBus>,
    resilience: Resilience,
    processor: Arc<BatchProcessor>,
    processing: Arc<ProcessingSet>,
    metrics: Arc<SyncMetrics>,
    shared: Arc<Shared>,
    /// Serializes start/stop and holds the running pipeline.
    pipeline: tokio::sync::Mutex<Option<Pipeline>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl SyncOrchestrator {
    pub fn builder() -> SyncOrchestratorBuilder {
        SyncOrchestratorBuilder::default()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Snapshot of the current status; never a live reference.
    pub fn get_status(&self) -> SyncStatus {
        self.shared.snapshot()
    }

    pub fn circuit_stats(&self) -> CircuitBreakerStats {
        self.resilience.breaker.stats()
    }

    pub fn retry_stats(&self) -> RetryStats {
        self.resilience.retry.stats()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SyncError::Disposed("orchestrator"));
        }
        Ok(())
    }

    /// Validate the repository, subscribe to changes and start the pipeline.
    ///
    /// A no-op (with a warning) when already running. Resets the status,
    /// including the consecutive-failure count.
    pub async fn start(&self) -> Result<()> {
        self.ensure_live()?;
        let mut slot = self.pipeline.lock().await;
        if self.shared.snapshot().is_running {
            warn!("sync already running; start ignored");
            return Ok(());
        }
        if let Some(stale) = slot.take() {
            debug!("tearing down pipeline left by a critical shutdown");
            stale.shutdown.send_replace(true);
            let _ = stale.aggregator.await;
            let _ = stale.worker.await;
        }

        if !self.vcs.is_repository().await? {
            return Err(SyncError::NotARepository(self.config.root.clone()));
        }
        let events = self.source.subscribe().await?;

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.update(|s| {
            *s = SyncStatus {
                is_running: true,
                ..SyncStatus::default()
            }
        });
        *slot = Some(self.spawn_pipeline(events, generation));
        self.ensure_maintenance();
        drop(slot);

        obs::emit_sync_started(&self.config.root);
        publish(
            &self.bus,
            EventPayload::SyncStarted {
                root: self.config.root.clone(),
            },
        )
        .await;
        Ok(())
    }

    /// Stop watching and drain in-flight work.
    ///
    /// Pending debounce and window timers are cancelled. Files still being
    /// processed after `drain_timeout` are left to finish in the background
    /// and reported in the `sync.stopped` payload.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.pipeline.lock().await;
        let Some(pipeline) = slot.take() else {
            debug!("stop called while stopped");
            return Ok(());
        };
        let was_running = self.shared.snapshot().is_running;

        pipeline.shutdown.send_replace(true);
        if let Err(e) = pipeline.aggregator.await {
            warn!(error = %e, "aggregator task ended abnormally");
        }

        let in_flight = self
            .processing
            .wait_until_empty(self.config.drain_timeout)
            .await;
        if in_flight > 0 {
            warn!(
                in_flight,
                timeout_ms = self.config.drain_timeout.as_millis() as u64,
                "drain timed out; in-flight files will finish in the background"
            );
        } else if let Err(e) = pipeline.worker.await {
            warn!(error = %e, "worker task ended abnormally");
        }

        let total_processed = self.shared.update(|s| {
            s.is_running = false;
            s.total_processed
        });
        drop(slot);
        self.metrics.flush();

        if was_running {
            obs::emit_sync_stopped(total_processed, in_flight);
            publish(
                &self.bus,
                EventPayload::SyncStopped {
                    total_processed,
                    in_flight,
                },
            )
            .await;
        }
        Ok(())
    }

    /// Synchronize everything the repository reports as changed, once.
    ///
    /// Independent of the background pipeline; paths it is currently handling
    /// are skipped.
    pub async fn sync_now(&self) -> Result<SyncResult> {
        self.ensure_live()?;
        if self.config.pull_before_sync {
            self.processor.pull().await?;
        }

        let status = self
            .resilience
            .run("vcs.status", || self.vcs.status())
            .await?;
        let filter = self.config.path_filter();
        let paths = status
            .changed_paths()
            .into_iter()
            .map(std::path::PathBuf::from)
            .filter(|p| filter.is_relevant(p))
            .collect();
        let batch = ChangeBatch::new(paths);
        debug!(batch_id = %batch.id, files = batch.len(), "manual sync");

        let result = self
            .processor
            .process(&batch)
            .instrument(obs::batch_span(batch.id))
            .await?;
        self.shared.update(|s| {
            s.last_sync = Some(result.timestamp);
            s.total_processed += result.processed_files.len() as u64;
            s.error_count += result.errors.len() as u64;
        });
        info!(
            processed = result.processed_files.len(),
            errors = result.errors.len(),
            "manual sync finished"
        );
        Ok(result.into())
    }

    /// Stop, then permanently disable the orchestrator, its bus and its
    /// resilience components.
    pub async fn dispose(&self) -> Result<()> {
        self.stop().await?;
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self
            .maintenance
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self.resilience.dispose();
        self.bus.dispose();
        Ok(())
    }

    fn ensure_maintenance(&self) {
        let mut slot = self.maintenance.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().map_or(true, |task| task.is_finished()) {
            *slot = Some(
                self.resilience
                    .breaker
                    .spawn_maintenance(self.config.maintenance_interval),
            );
        }
    }

    fn spawn_pipeline(&self, events: mpsc::Receiver<FileChangeEvent>, generation: u64) -> Pipeline {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown = Arc::new(shutdown_tx);
        let (batch_tx, batch_rx) = mpsc::channel(1);

        let aggregator = ChangeAggregator::new(
            AggregatorConfig::from(&*self.config),
            self.config.path_filter(),
            Arc::clone(&self.processing),
        );
        let aggregator = tokio::spawn(aggregator.run(events, batch_tx, shutdown_rx));

        let worker = Worker {
            max_consecutive_failures: self.config.max_consecutive_failures,
            bus: Arc::clone(&self.bus),
            processor: Arc::clone(&self.processor),
            processing: Arc::clone(&self.processing),
            metrics: Arc::clone(&self.metrics),
            shared: Arc::clone(&self.shared),
            shutdown: Arc::clone(&shutdown),
            generation,
        };
        let worker = tokio::spawn(worker.run(batch_rx));

        Pipeline {
            shutdown,
            aggregator,
            worker,
        }
    }
}

/// Consumes batches from the aggregator, one at a time.
struct Worker {
    max_consecutive_failures: u32,
    bus: Arc<EventBus>,
    processor: Arc<BatchProcessor>,
    processing: Arc<ProcessingSet>,
    metrics: Arc<SyncMetrics>,
    shared: Arc<Shared>,
    shutdown: Arc<watch::Sender<bool>>,
    generation: u64,
}

impl Worker {
    async fn run(self, mut batches: mpsc::Receiver<ChangeBatch>) {
        let mut halted = false;
        while let Some(batch) = batches.recv().await {
            if halted {
                self.processing.release(&batch.paths);
                continue;
            }
            let span = obs::batch_span(batch.id);
            halted = self.handle(batch).instrument(span).await;
        }
        debug!("worker finished");
    }

    fn is_current(&self) -> bool {
        self.shared.generation.load(Ordering::SeqCst) == self.generation
    }

    /// Process one batch. Returns true when it triggered a critical shutdown.
    async fn handle(&self, batch: ChangeBatch) -> bool {
        let file_count = batch.len();
        obs::emit_batch_started(batch.id, file_count);
        publish(
            &self.bus,
            EventPayload::BatchStarted {
                batch_id: batch.id,
                file_count,
            },
        )
        .await;

        let outcome = self.processor.process_claimed(&batch).await;
        match outcome {
            Ok(result) if !result.all_failed() => {
                self.on_success(&result).await;
                false
            }
            Ok(result) => {
                let summary = result
                    .errors
                    .iter()
                    .map(|e| format!("{}: {}", e.file, e.error))
                    .collect::<Vec<_>>()
                    .join("; ");
                self.shared
                    .update(|s| s.error_count += result.errors.len() as u64);
                self.on_failure(batch.id, file_count, summary).await
            }
            Err(err) => self.on_failure(batch.id, file_count, err.to_string()).await,
        }
    }

    async fn on_success(&self, result: &BatchProcessingResult) {
        self.metrics.inc_batches_processed();
        self.shared.update(|s| {
            s.last_sync = Some(result.timestamp);
            s.total_processed += result.processed_files.len() as u64;
            s.error_count += result.errors.len() as u64;
            s.consecutive_failures = 0;
        });
        let duration_ms = result.total_time.as_millis() as u64;
        obs::emit_batch_finished(
            result.batch_id,
            result.processed_files.len(),
            result.skipped_files.len(),
            result.errors.len(),
            duration_ms,
            result.errors.is_empty(),
        );
        publish(
            &self.bus,
            EventPayload::BatchCompleted {
                batch_id: result.batch_id,
                processed: result.processed_files.len(),
                skipped: result.skipped_files.len(),
                errors: result
                    .errors
                    .iter()
                    .map(|e| format!("{}: {}", e.file, e.error))
                    .collect(),
                commit_id: result.commit_id.clone(),
                push_error: result.push_error.clone(),
                duration_ms,
            },
        )
        .await;
    }

    async fn on_failure(&self, batch_id: uuid::Uuid, file_count: usize, error: String) -> bool {
        self.metrics.inc_batches_failed();
        let consecutive_failures = self.shared.update(|s| {
            s.error_count += 1;
            s.consecutive_failures += 1;
            s.consecutive_failures
        });
        obs::emit_batch_failed(batch_id, consecutive_failures, &error);
        publish(
            &self.bus,
            EventPayload::BatchFailed {
                batch_id,
                file_count,
                error: error.clone(),
                consecutive_failures,
            },
        )
        .await;

        if consecutive_failures < self.max_consecutive_failures {
            return false;
        }
        self.critical_shutdown(consecutive_failures, error).await;
        true
    }

    async fn critical_shutdown(&self, consecutive_failures: u32, error: String) {
        self.shutdown.send_replace(true);
        let parked = self.is_current()
            && self.shared.update(|s| {
                let was_running = s.is_running;
                s.is_running = false;
                was_running
            });
        if !parked {
            return;
        }
        obs::emit_critical_shutdown(consecutive_failures, &error);
        publish(
            &self.bus,
            EventPayload::SyncFailed {
                consecutive_failures,
                error,
            },
        )
        .await;
    }
}

async fn publish(bus: &EventBus, payload: EventPayload) {
    if let Err(e) = bus.publish(Event::new(payload)).await {
        debug!(error = %e, "event dropped");
    }
}
