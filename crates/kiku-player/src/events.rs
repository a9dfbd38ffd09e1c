//! Lifecycle event delivery.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crossbeam_channel::Sender;
use kiku_types::PlayerEvent;

/// Observer receiving lifecycle events from the player.
///
/// Called from the worker thread and from the caller's thread. Implementations
/// should return quickly; a panicking sink is logged and otherwise ignored.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: PlayerEvent);
}

impl<F> EventSink for F
where
    F: Fn(PlayerEvent) + Send + Sync,
{
    fn on_event(&self, event: PlayerEvent) {
        self(event)
    }
}

impl EventSink for Sender<PlayerEvent> {
    fn on_event(&self, event: PlayerEvent) {
        let _ = self.send(event);
    }
}

/// Deliver `event` to `sink`, containing any panic raised by the sink.
pub(crate) fn emit(sink: &Arc<dyn EventSink>, event: PlayerEvent) {
    tracing::debug!(code = event.code(), value = ?event.value(), "player event");
    if catch_unwind(AssertUnwindSafe(|| sink.on_event(event))).is_err() {
        tracing::warn!(code = event.code(), "event sink panicked");
    }
}
