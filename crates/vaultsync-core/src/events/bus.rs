//! In-process publish/subscribe bus with bounded history.
//!
//! Handler failures (errors or panics) never reach the publisher: each one is
//! logged and re-published once as a `system.error` event. Failures of
//! `system.error` handlers are only logged.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::event::{Event, EventKind, EventPayload};
use crate::domain::{Result, SyncError};
use crate::obs;

/// Default number of events kept in history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Receives events of the kinds it was subscribed to.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and `system.error` payloads.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type HandlerMap = HashMap<EventKind, Vec<(SubscriptionId, Arc<dyn EventHandler>)>>;

struct HandlerFailure {
    handler: String,
    error: String,
}

/// Typed publish/subscribe channel. Construct one per pipeline and share it
/// through an `Arc`.
pub struct EventBus {
    handlers: RwLock<HandlerMap>,
    history: Mutex<VecDeque<Event>>,
    capacity: usize,
    next_id: AtomicU64,
    disposed: AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(capacity: usize) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY))),
            capacity,
            next_id: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SyncError::Disposed("event bus"));
        }
        Ok(())
    }

    /// Register `handler` for events of `kind`.
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId> {
        self.ensure_live()?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        debug!(kind = %kind, handler = handler.name(), "handler subscribed");
        handlers.entry(kind).or_default().push((id, handler));
        Ok(id)
    }

    /// Register an async closure for events of `kind`.
    pub fn subscribe_fn<F, Fut>(
        &self,
        kind: EventKind,
        name: impl Into<String>,
        f: F,
    ) -> Result<SubscriptionId>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe(kind, Arc::new(FnHandler::new(name, f)))
    }

    /// Remove a subscription. Returns whether it was registered.
    pub fn unsubscribe(&self, kind: &EventKind, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let Some(list) = handlers.get_mut(kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sid, _)| *sid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(kind);
        }
        removed
    }

    /// Number of handlers currently registered for `kind`.
    pub fn listener_count(&self, kind: &EventKind) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(kind)
            .map_or(0, Vec::len)
    }

    /// Publish `event` and wait for every handler to finish.
    ///
    /// Only fails when the bus has been disposed.
    pub async fn publish(&self, event: Event) -> Result<()> {
        self.ensure_live()?;
        self.record(&event);
        let failures = self.dispatch(&event).await;

        if event.kind == EventKind::SystemError {
            return Ok(());
        }
        for failure in failures {
            let error_event = Event::new(EventPayload::SystemError {
                source_kind: event.kind.to_string(),
                handler: failure.handler,
                error: failure.error,
            });
            self.record(&error_event);
            self.dispatch(&error_event).await;
        }
        Ok(())
    }

    /// Publish on a background task without waiting for handlers.
    pub fn publish_non_blocking(self: &Arc<Self>, event: Event) -> Result<()> {
        self.ensure_live()?;
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = bus.publish(event).await {
                debug!(error = %e, "non-blocking publish dropped");
            }
        });
        Ok(())
    }

    /// Recorded events, oldest first. `limit` keeps the most recent entries.
    pub fn history(&self, kind: Option<&EventKind>, limit: Option<usize>) -> Vec<Event> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let matching: Vec<Event> = history
            .iter()
            .filter(|e| kind.map_or(true, |k| &e.kind == k))
            .cloned()
            .collect();
        match limit {
            Some(n) if n < matching.len() => matching[matching.len() - n..].to_vec(),
            _ => matching,
        }
    }

    /// Wait for the next event of `kind`.
    ///
    /// The temporary subscription is removed whether the wait succeeds, times
    /// out, or the bus is disposed.
    pub async fn wait_for(&self, kind: EventKind, timeout: Option<Duration>) -> Result<Event> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let id = self.subscribe_fn(kind.clone(), format!("wait_for({kind})"), move |event| {
            let slot = Arc::clone(&slot);
            async move {
                let sender = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
                if let Some(sender) = sender {
                    let _ = sender.send(event);
                }
                Ok(())
            }
        })?;

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received.map_err(|_| SyncError::Disposed("event bus")),
                Err(_) => Err(SyncError::Timeout {
                    kind: kind.to_string(),
                }),
            },
            None => rx.await.map_err(|_| SyncError::Disposed("event bus")),
        };

        self.unsubscribe(&kind, id);
        outcome
    }

    /// Permanently disable the bus, dropping all handlers and history.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        debug!("event bus disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn record(&self, event: &Event) {
        if self.capacity == 0 {
            return;
        }
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(event.clone());
    }

    async fn dispatch(&self, event: &Event) -> Vec<HandlerFailure> {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let map = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            map.get(&event.kind)
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };

        let calls = handlers.iter().map(|handler| async move {
            let outcome = AssertUnwindSafe(handler.handle(event)).catch_unwind().await;
            let error = match outcome {
                Ok(Ok(())) => return None,
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => panic_message(panic.as_ref()),
            };
            obs::emit_handler_failed(event.kind.as_str(), handler.name(), &error);
            Some(HandlerFailure {
                handler: handler.name().to_string(),
                error,
            })
        });

        join_all(calls).await.into_iter().flatten().collect()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        warn!("handler panicked with a non-string payload");
        "handler panicked".to_string()
    }
}
