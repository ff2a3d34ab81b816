//! # Completion slot: single-assignment promise.
//!
//! A [`Slot`] is the resolving side of a `oneshot` channel that many parties may
//! race to resolve (external result, dispatch watcher, timeout monitor, reaper,
//! disposal). The first `resolve` wins; every later call is a no-op returning `false`.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

/// Resolving side of a completion slot. Clones share the same state.
pub(crate) struct Slot<T> {
    tx: Arc<Mutex<Option<oneshot::Sender<T>>>>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

/// Creates a slot and the receiver the awaiting party suspends on.
pub(crate) fn slot<T>() -> (Slot<T>, oneshot::Receiver<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Slot {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        rx,
    )
}

impl<T> Slot<T> {
    /// Resolves the slot. Returns `true` only for the call that resolved it.
    ///
    /// A slot whose receiver is already gone still counts as resolved.
    pub(crate) fn resolve(&self, value: T) -> bool {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        match tx {
            Some(tx) => {
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    /// Returns true if nobody is waiting on this slot any more.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_none_or(|tx| tx.is_closed())
    }
}
