//! Change-notification sources.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::{FileChangeEvent, Result};

/// Produces a stream of [`FileChangeEvent`]s for the synchronized root.
///
/// Delivery may contain duplicates and arrive out of order; the aggregator
/// tolerates both. Dropping the receiver unsubscribes.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn subscribe(&self) -> Result<mpsc::Receiver<FileChangeEvent>>;
}
