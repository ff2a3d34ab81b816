//! # Relay channel: the internally owned stream buffer.
//!
//! Every stream request gets an unbounded buffer owned by the task manager.
//! The caller holds the readable half ([`RelayStream`]); the manager keeps the
//! writable half ([`StreamWriter`]) in the stream registry and feeds it from
//! whatever external source is supplied later.
//!
//! ## Rules
//! - The writer is closed **exactly once**, either successfully or with an error;
//!   later close attempts are no-ops (`false`).
//! - Closing with an error delivers one final `Err` item, then the stream ends.
//! - Closing drops the sender even if other clones of the writer are still held,
//!   so a consumer always observes a terminal signal.
//! - `try_write` fails once the writer is closed or the consumer dropped the handle.

use std::any::{Any, type_name};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::RelayError;

type Item<T> = Result<T, RelayError>;

/// Creates a connected writer/reader pair.
pub(crate) fn relay_channel<T: Send + 'static>() -> (StreamWriter<T>, RelayStream<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        StreamWriter {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        RelayStream { rx },
    )
}

/// Writable side of a relay buffer.
///
/// Cheap to clone; all clones share the same close state.
pub(crate) struct StreamWriter<T> {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<Item<T>>>>>,
}

impl<T> Clone for StreamWriter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T: Send + 'static> StreamWriter<T> {
    /// Buffers one item. Returns `false` if the writer is closed or the reader is gone.
    pub(crate) fn try_write(&self, item: T) -> bool {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(Ok(item)).is_ok(),
            None => false,
        }
    }

    /// Closes the buffer successfully. Returns `false` if it was already closed.
    pub(crate) fn complete(&self) -> bool {
        self.take().is_some()
    }

    /// Closes the buffer with a terminal error. Returns `false` if it was already closed.
    pub(crate) fn fail(&self, err: RelayError) -> bool {
        match self.take() {
            Some(tx) => {
                let _ = tx.send(Err(err));
                true
            }
            None => false,
        }
    }

    fn take(&self) -> Option<mpsc::UnboundedSender<Item<T>>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Readable handle returned to the caller of
/// [`TaskManager::channel_stream_response`](crate::TaskManager::channel_stream_response).
///
/// Yields items in write order; a terminal failure arrives as a single `Err` item.
#[derive(Debug)]
pub struct RelayStream<T> {
    rx: mpsc::UnboundedReceiver<Item<T>>,
}

impl<T> RelayStream<T> {
    /// Receives the next item, or `None` once the buffer is closed and drained.
    pub async fn recv(&mut self) -> Option<Item<T>> {
        self.rx.recv().await
    }
}

impl<T> Stream for RelayStream<T> {
    type Item = Item<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Item-type-agnostic view of a [`StreamWriter`] held by the stream registry.
pub(crate) trait ErasedWriter: Send + Sync {
    /// Closes successfully; `false` if already closed.
    fn complete(&self) -> bool;

    /// Closes with an error; `false` if already closed.
    fn fail(&self, err: RelayError) -> bool;

    /// Name of the buffered item type.
    fn item_type(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;
}

impl<T: Send + 'static> ErasedWriter for StreamWriter<T> {
    fn complete(&self) -> bool {
        StreamWriter::complete(self)
    }

    fn fail(&self, err: RelayError) -> bool {
        StreamWriter::fail(self, err)
    }

    fn item_type(&self) -> &'static str {
        type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn ErasedWriter {
    /// Recovers the typed writer if `T` matches the buffered item type.
    pub(crate) fn typed<T: Send + 'static>(&self) -> Option<StreamWriter<T>> {
        self.as_any().downcast_ref::<StreamWriter<T>>().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_items_arrive_in_order_then_end() {
        let (w, r) = relay_channel::<u32>();
        assert!(w.try_write(1));
        assert!(w.try_write(2));
        assert!(w.complete());

        let items: Vec<_> = r.collect().await;
        assert_eq!(items, vec![Ok(1), Ok(2)]);
    }

    #[tokio::test]
    async fn test_close_is_single_shot() {
        let (w, mut r) = relay_channel::<u32>();
        assert!(w.fail(RelayError::Disposed));
        assert!(!w.complete());
        assert!(!w.fail(RelayError::Disposed));
        assert!(!w.try_write(3));

        assert_eq!(r.recv().await, Some(Err(RelayError::Disposed)));
        assert_eq!(r.recv().await, None);
    }

    #[tokio::test]
    async fn test_close_through_clone_ends_stream() {
        let (w, mut r) = relay_channel::<&'static str>();
        let held = w.clone();
        assert!(w.complete());
        assert!(!held.try_write("late"));
        assert_eq!(r.recv().await, None);
    }

    #[test]
    fn test_write_fails_after_reader_dropped() {
        let (w, r) = relay_channel::<u32>();
        drop(r);
        assert!(!w.try_write(1));
    }

    #[test]
    fn test_erased_writer_downcast() {
        let (w, _r) = relay_channel::<String>();
        let erased: Arc<dyn ErasedWriter> = Arc::new(w);
        assert!(erased.typed::<String>().is_some());
        assert!(erased.typed::<u64>().is_none());
        assert!(erased.item_type().contains("String"));
    }
}
