//! Change aggregation: per-path debounce, then time-boxed batches.
//!
//! Each relevant event (re)starts a debounce timer for its path; later events
//! for the same path replace the earlier one. A path whose timer expires is
//! *settled*. When the batch window closes, settled paths that are not being
//! processed are claimed in the [`ProcessingSet`] and handed off as one
//! [`ChangeBatch`], at most `max_batch_size` at a time. The rest wait for the
//! next window.
//!
//! The bookkeeping methods take `now` explicitly; [`ChangeAggregator::run`]
//! drives them from tokio timers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::config::{PathFilter, SyncConfig};
use crate::domain::{ChangeBatch, FileChangeEvent};
use crate::processing_set::ProcessingSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorConfig {
    pub debounce: Duration,
    pub batch_window: Duration,
    pub max_batch_size: usize,
}

impl From<&SyncConfig> for AggregatorConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            debounce: config.debounce,
            batch_window: config.batch_window,
            max_batch_size: config.max_batch_size,
        }
    }
}

/// Counters for events seen by the aggregator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorStats {
    pub received: u64,
    /// Dropped by the path filter.
    pub filtered: u64,
    /// Collapsed into an existing entry for the same path.
    pub coalesced: u64,
    /// Older than the entry already held for the path.
    pub stale: u64,
    pub batches_emitted: u64,
}

#[derive(Debug)]
struct Entry {
    event: FileChangeEvent,
    due: Instant,
    settled: bool,
}

pub struct ChangeAggregator {
    config: AggregatorConfig,
    filter: PathFilter,
    processing: Arc<ProcessingSet>,
    entries: BTreeMap<PathBuf, Entry>,
    stats: AggregatorStats,
}

impl ChangeAggregator {
    pub fn new(config: AggregatorConfig, filter: PathFilter, processing: Arc<ProcessingSet>) -> Self {
        Self {
            config,
            filter,
            processing,
            entries: BTreeMap::new(),
            stats: AggregatorStats::default(),
        }
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats
    }

    /// Paths still inside their debounce window.
    pub fn pending_len(&self) -> usize {
        self.entries.values().filter(|e| !e.settled).count()
    }

    /// Paths waiting for the batch window to close.
    pub fn settled_len(&self) -> usize {
        self.entries.values().filter(|e| e.settled).count()
    }

    /// The most recent effective event held for `path` (root-relative).
    pub fn latest(&self, path: &std::path::Path) -> Option<&FileChangeEvent> {
        self.entries.get(path).map(|e| &e.event)
    }

    /// Record one event observed at `now`. Returns whether it became the
    /// effective event for its path.
    pub fn record(&mut self, event: FileChangeEvent, now: Instant) -> bool {
        self.stats.received += 1;
        if !self.filter.is_relevant(&event.path) {
            self.stats.filtered += 1;
            trace!(path = %event.path.display(), "ignoring irrelevant path");
            return false;
        }
        let path = self.filter.relative(&event.path).to_path_buf();
        let due = now + self.config.debounce;

        match self.entries.get_mut(&path) {
            Some(entry) => {
                self.stats.coalesced += 1;
                if event.timestamp < entry.event.timestamp {
                    self.stats.stale += 1;
                    debug!(path = %path.display(), "dropping out-of-order event");
                    return false;
                }
                entry.event = event;
                entry.due = due;
                entry.settled = false;
            }
            None => {
                self.entries.insert(
                    path,
                    Entry {
                        event,
                        due,
                        settled: false,
                    },
                );
            }
        }
        true
    }

    /// Settle every path whose debounce window has passed. Returns how many settled.
    pub fn promote_due(&mut self, now: Instant) -> usize {
        let mut count = 0;
        for entry in self.entries.values_mut() {
            if !entry.settled && entry.due <= now {
                entry.settled = true;
                count += 1;
            }
        }
        count
    }

    /// Earliest debounce expiry, if any path is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter(|e| !e.settled)
            .map(|e| e.due)
            .min()
    }

    /// Claim and remove up to `max_batch_size` settled paths.
    ///
    /// Paths already in the processing set stay queued for a later window.
    pub fn drain_batch(&mut self) -> Option<ChangeBatch> {
        let mut taken = Vec::new();
        for (path, entry) in &self.entries {
            if taken.len() >= self.config.max_batch_size {
                break;
            }
            if !entry.settled {
                continue;
            }
            let claim = std::slice::from_ref(path);
            if self.processing.try_claim(claim).is_empty() {
                taken.push(path.clone());
            } else {
                trace!(path = %path.display(), "path busy; deferring");
            }
        }
        if taken.is_empty() {
            return None;
        }
        for path in &taken {
            self.entries.remove(path);
        }
        self.stats.batches_emitted += 1;
        Some(ChangeBatch::new(taken))
    }

    /// Drive the aggregator until `shutdown` flips, the batch receiver goes
    /// away, or the event stream ends and everything queued has been handed off.
    ///
    /// Each send waits for the consumer to accept the previous batch, so
    /// windows are strictly sequential. A batch that cannot be handed off has
    /// its claims released.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<FileChangeEvent>,
        batches: mpsc::Sender<ChangeBatch>,
        mut shutdown: watch::Receiver<bool>,
    ) -> AggregatorStats {
        let window = self.config.batch_window;
        let mut ticker = tokio::time::interval_at(Instant::now() + window, window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut source_open = true;

        loop {
            if *shutdown.borrow() {
                break;
            }
            if !source_open && self.entries.is_empty() {
                debug!("change source closed and queue empty");
                break;
            }
            let deadline = self.next_deadline();

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                received = events.recv(), if source_open => match received {
                    Some(event) => {
                        self.record(event, Instant::now());
                    }
                    None => source_open = false,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(|| Instant::now() + window)),
                    if deadline.is_some() =>
                {
                    self.promote_due(Instant::now());
                }
                _ = ticker.tick() => {
                    self.promote_due(Instant::now());
                    let Some(batch) = self.drain_batch() else { continue };
                    debug!(batch_id = %batch.id, files = batch.len(), "window closed");
                    tokio::select! {
                        permit = batches.reserve() => match permit {
                            Ok(permit) => permit.send(batch),
                            Err(_) => {
                                self.processing.release(&batch.paths);
                                break;
                            }
                        },
                        _ = shutdown.changed() => {
                            self.processing.release(&batch.paths);
                            break;
                        }
                    }
                }
            }
        }
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::Path;

    fn aggregator(max: usize) -> ChangeAggregator {
        ChangeAggregator::new(
            AggregatorConfig {
                debounce: Duration::from_millis(300),
                batch_window: Duration::from_secs(2),
                max_batch_size: max,
            },
            PathFilter::new(Path::new("/vault"), &["md".into()], true),
            Arc::new(ProcessingSet::new()),
        )
    }

    #[test]
    fn burst_collapses_to_latest_event() {
        let mut agg = aggregator(10);
        let t0 = Instant::now();
        for i in 0..5 {
            agg.record(
                FileChangeEvent::modified("/vault/a.md"),
                t0 + Duration::from_millis(50 * i),
            );
        }
        assert_eq!(agg.pending_len(), 1);
        assert_eq!(agg.stats().coalesced, 4);
        // Trailing debounce: the window restarts with the last event.
        assert_eq!(agg.next_deadline(), Some(t0 + Duration::from_millis(500)));
        assert_eq!(agg.promote_due(t0 + Duration::from_millis(499)), 0);
        assert_eq!(agg.promote_due(t0 + Duration::from_millis(500)), 1);
        let batch = agg.drain_batch().unwrap();
        assert_eq!(batch.paths, vec![PathBuf::from("a.md")]);
    }

    #[test]
    fn older_event_never_replaces_newer_one() {
        let mut agg = aggregator(10);
        let now = Instant::now();
        let newer = Utc::now();
        let older = newer - chrono::Duration::seconds(5);
        assert!(agg.record(FileChangeEvent::deleted("/vault/a.md").at(newer), now));
        assert!(!agg.record(FileChangeEvent::modified("/vault/a.md").at(older), now));
        let latest = agg.latest(Path::new("a.md")).unwrap();
        assert_eq!(latest.change_kind, crate::domain::ChangeKind::Deleted);
        assert_eq!(agg.stats().stale, 1);
    }

    #[test]
    fn irrelevant_paths_are_filtered() {
        let mut agg = aggregator(10);
        let now = Instant::now();
        assert!(!agg.record(FileChangeEvent::modified("/vault/.git/index"), now));
        assert!(!agg.record(FileChangeEvent::modified("/vault/img.png"), now));
        assert_eq!(agg.stats().filtered, 2);
        assert_eq!(agg.pending_len(), 0);
    }

    #[test]
    fn excess_and_busy_paths_are_deferred_not_dropped() {
        let mut agg = aggregator(2);
        let processing = Arc::clone(&agg.processing);
        processing.try_claim(&[PathBuf::from("b.md")]);

        let now = Instant::now();
        for name in ["a.md", "b.md", "c.md", "d.md"] {
            agg.record(FileChangeEvent::modified(format!("/vault/{name}")), now);
        }
        agg.promote_due(now + Duration::from_secs(1));

        let first = agg.drain_batch().unwrap();
        assert_eq!(first.paths, vec![PathBuf::from("a.md"), PathBuf::from("c.md")]);
        assert!(processing.contains(Path::new("a.md")));

        processing.release(&[PathBuf::from("b.md")]);
        let second = agg.drain_batch().unwrap();
        assert_eq!(second.paths, vec![PathBuf::from("b.md"), PathBuf::from("d.md")]);
        assert!(agg.drain_batch().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn run_emits_one_batch_per_window_and_stops_on_shutdown() {
        let agg = aggregator(10);
        let processing = Arc::clone(&agg.processing);
        let (event_tx, event_rx) = mpsc::channel(16);
        let (batch_tx, mut batch_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(agg.run(event_rx, batch_tx, stop_rx));

        for _ in 0..3 {
            event_tx.send(FileChangeEvent::modified("/vault/a.md")).await.unwrap();
        }
        event_tx.send(FileChangeEvent::created("/vault/b.md")).await.unwrap();

        let batch = batch_rx.recv().await.unwrap();
        assert_eq!(batch.paths, vec![PathBuf::from("a.md"), PathBuf::from("b.md")]);
        processing.release(&batch.paths);

        stop_tx.send(true).unwrap();
        let stats = task.await.unwrap();
        assert_eq!(stats.received, 4);
        assert_eq!(stats.coalesced, 2);
        assert_eq!(stats.batches_emitted, 1);
        assert!(batch_rx.recv().await.is_none());
    }
}
