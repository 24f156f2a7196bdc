//! Event channel: typed lifecycle events and the bus that carries them.

pub mod bus;
pub mod event;

pub use bus::{EventBus, EventHandler, FnHandler, SubscriptionId, DEFAULT_HISTORY_CAPACITY};
pub use event::{Event, EventKind, EventPayload};
