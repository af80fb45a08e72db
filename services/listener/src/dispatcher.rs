//! Deferred deletion and time source.
//!
//! Objects that may still be on the call stack (a connection removing itself
//! from inside its own close event, a connection group emptied during a
//! drain) are never dropped synchronously. They are detached from their owner
//! and parked on the dispatcher's deferred-delete list, which the event loop
//! clears between iterations.

use std::time::Instant;

use tracing::trace;

/// An object whose destruction is postponed to the end of the loop turn.
pub trait DeferredDeletable {
    /// Short label used in trace logs.
    fn label(&self) -> String;
}

/// The event loop primitives the listener needs.
pub trait Dispatcher {
    /// Park an object for destruction at the next safe point.
    fn deferred_delete(&mut self, item: Box<dyn DeferredDeletable>);

    /// Drop every parked object. Called by the event loop between iterations.
    fn clear_deferred_delete_list(&mut self) -> usize;

    fn now(&self) -> Instant;
}

/// Single-threaded dispatcher backed by a plain list.
#[derive(Default)]
pub struct LocalDispatcher {
    to_delete: Vec<Box<dyn DeferredDeletable>>,
}

impl LocalDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects awaiting destruction.
    pub fn pending_deletions(&self) -> usize {
        self.to_delete.len()
    }
}

impl Dispatcher for LocalDispatcher {
    fn deferred_delete(&mut self, item: Box<dyn DeferredDeletable>) {
        trace!(item = %item.label(), "Deferring delete");
        self.to_delete.push(item);
    }

    fn clear_deferred_delete_list(&mut self) -> usize {
        let batch = std::mem::take(&mut self.to_delete);
        let count = batch.len();
        drop(batch);

        if count > 0 {
            trace!(count = count, "Cleared deferred delete list");
        }
        count
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl std::fmt::Debug for LocalDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDispatcher")
            .field("pending_deletions", &self.to_delete.len())
            .finish()
    }
}
