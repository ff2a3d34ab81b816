//! # Stream correlation: hand out a reader now, feed it later.
//!
//! A stream request returns a [`RelayStream`] over an internally owned buffer as
//! soon as the invoker has been sent. Data arrives later, when some other party
//! calls [`TaskManager::set_channel_stream_result`] with an external source, which
//! is copied item by item into the buffer.
//!
//! ## Flow
//! ```text
//! channel_stream_response(instance, connection, request, invoker, cancel)
//!   ├─► relay_channel::<T>()           (reader kept by caller, writer erased)
//!   ├─► capacity?  no ─► enqueue_stream() ─► await queued slot
//!   ├─► register_stream()              (entry + timeout monitor, atomically)
//!   └─► drive_invoker()                (invoker task vs readiness slot vs caller token)
//!         ├─ Ok        → readiness resolved, reader returned
//!         └─ Err       → cleanup_stream(Err) → error returned
//!
//! set_channel_stream_result(request, source)
//!   ├─► lookup writer (unknown id → warn, Ok)
//!   ├─► copy items until source ends / fails / reader gone
//!   └─► cleanup_stream(outcome)
//!
//! monitor (one per stream)
//!   sleep(default_timeout) | token.cancelled()
//!   └─ expired → same-generation stream removed, writer fails with Timeout
//! ```
//!
//! ## Rules
//! - Lock order is always `streams` before `monitors`; no map guard is held across `.await`.
//! - A stream entry and its monitor are inserted under the same `streams` shard lock.
//! - Every removal force-closes the writer, so the reader always sees a terminal signal.

use std::any::type_name;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::{ErasedWriter, RelayStream, relay_channel};
use crate::error::{DispatchError, RelayError};
use crate::events::{Event, EventKind};

use super::manager::{TaskManager, caller_cancelled, lock, validate_ids};
use super::slot::{Slot, slot};

/// How long cleanup waits for a cancelled monitor to finish.
pub const MONITOR_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Readiness of a stream: `Ok` once the invoker completed, `Err` on teardown.
pub(super) type Readiness = Result<(), RelayError>;

/// Boxed stream invoker.
pub(super) type Invoker =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<(), DispatchError>> + Send>;

/// Registry entry of a pending stream.
pub(crate) struct ManagedStream {
    pub(super) instance_id: String,
    pub(super) connection_id: String,
    pub(super) writer: Arc<dyn ErasedWriter>,
    pub(super) ready: Slot<Readiness>,
    pub(super) created_at: Instant,
    pub(super) generation: u64,
}

impl ManagedStream {
    /// Closes the buffer and settles readiness with the same outcome.
    pub(super) fn close(&self, outcome: Readiness) {
        match outcome {
            Ok(()) => {
                self.writer.complete();
                self.ready.resolve(Ok(()));
            }
            Err(err) => {
                self.writer.fail(err.clone());
                self.ready.resolve(Err(err));
            }
        }
    }
}

/// Timeout monitor of one stream.
pub(crate) struct Monitor {
    pub(super) cancel: CancellationToken,
    pub(super) join: JoinHandle<()>,
    pub(super) generation: u64,
}

/// Handle returned by a successful stream registration.
pub(super) struct StreamAdmission {
    pub(super) ready: Slot<Readiness>,
    pub(super) ready_rx: oneshot::Receiver<Readiness>,
    pub(super) generation: u64,
}

impl TaskManager {
    /// Registers a stream request, sends it through `invoker`, and returns the
    /// reader of the internal buffer.
    ///
    /// Returns once `invoker` has completed; it does not wait for data. Items
    /// arrive after a matching [`set_channel_stream_result`](Self::set_channel_stream_result).
    /// A stream left unfed for `default_timeout` ends with a [`RelayError::Timeout`] item.
    pub async fn channel_stream_response<T, F, Fut>(
        &self,
        instance_id: &str,
        connection_id: &str,
        request_id: &str,
        invoker: F,
        cancel: Option<CancellationToken>,
    ) -> Result<RelayStream<T>, RelayError>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        self.ensure_live()?;
        validate_ids(instance_id, request_id)?;
        if connection_id.trim().is_empty() {
            return Err(RelayError::InvalidArgument {
                field: "connection_id",
            });
        }

        let (writer, reader) = relay_channel::<T>();
        let writer: Arc<dyn ErasedWriter> = Arc::new(writer);
        let invoker: Invoker = Box::new(move || invoker().boxed());

        if !self.has_stream_capacity() {
            self.enqueue_stream(
                instance_id,
                connection_id,
                request_id,
                writer,
                invoker,
                cancel,
            )
            .await?;
            return Ok(reader);
        }

        let admission = self.register_stream(instance_id, connection_id, request_id, writer)?;
        self.drive_invoker(request_id, admission, invoker, cancel.as_ref())
            .await?;
        Ok(reader)
    }

    /// Relays `source` into the buffer of the pending stream `request_id`.
    ///
    /// Copies items until the source ends, the source fails, or the reader is
    /// gone; then closes the buffer and removes the stream. A source error is
    /// delivered to the reader and returned as [`RelayError::Stream`].
    ///
    /// Unknown ids and item type mismatches are logged and ignored.
    pub async fn set_channel_stream_result<T, S, E>(
        &self,
        request_id: &str,
        source: S,
    ) -> Result<(), RelayError>
    where
        T: Send + 'static,
        S: Stream<Item = Result<T, E>>,
        E: Display,
    {
        self.ensure_live()?;

        let found = self
            .streams
            .get(request_id)
            .map(|s| (Arc::clone(&s.writer), s.generation));
        let Some((erased, generation)) = found else {
            warn!(request_id, "no pending channel stream found");
            self.bus.publish(
                Event::new(EventKind::UnknownRequest)
                    .with_request(request_id)
                    .with_reason("set_channel_stream_result"),
            );
            return Ok(());
        };
        let Some(writer) = erased.typed::<T>() else {
            warn!(
                request_id,
                expected = erased.item_type(),
                actual = type_name::<T>(),
                "stream item type mismatch; source ignored"
            );
            return Ok(());
        };

        let mut source = pin!(source);
        let mut relayed: u64 = 0;
        let mut failure = None;
        while let Some(item) = source.next().await {
            match item {
                Ok(item) => {
                    if !writer.try_write(item) {
                        debug!(request_id, relayed, "stream buffer closed; relay stopped");
                        break;
                    }
                    relayed += 1;
                }
                Err(e) => {
                    failure = Some(RelayError::Stream {
                        request_id: request_id.to_string(),
                        error: e.to_string(),
                    });
                    break;
                }
            }
        }

        match failure {
            None => {
                self.cleanup_stream(request_id, generation, Ok(())).await;
                debug!(request_id, relayed, "stream relayed");
                self.bus
                    .publish(Event::new(EventKind::StreamCompleted).with_request(request_id));
                Ok(())
            }
            Some(err) => {
                warn!(request_id, relayed, error = %err, "stream source failed");
                self.bus.publish(
                    Event::new(EventKind::StreamFailed)
                        .with_request(request_id)
                        .with_reason(err.to_string()),
                );
                self.cleanup_stream(request_id, generation, Err(err.clone()))
                    .await;
                Err(err)
            }
        }
    }

    /// Inserts a stream entry together with its timeout monitor. Never overwrites.
    pub(super) fn register_stream(
        &self,
        instance_id: &str,
        connection_id: &str,
        request_id: &str,
        writer: Arc<dyn ErasedWriter>,
    ) -> Result<StreamAdmission, RelayError> {
        let queued = lock(&self.stream_queue)
            .iter()
            .any(|q| q.request_id == request_id);
        if queued {
            return Err(RelayError::AlreadyPending {
                request_id: request_id.to_string(),
            });
        }

        let (ready, ready_rx) = slot();
        let generation = self.next_generation();
        match self.streams.entry(request_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(RelayError::AlreadyPending {
                    request_id: request_id.to_string(),
                });
            }
            Entry::Vacant(v) => {
                self.spawn_monitor(request_id, generation);
                v.insert(ManagedStream {
                    instance_id: instance_id.to_string(),
                    connection_id: connection_id.to_string(),
                    writer,
                    ready: ready.clone(),
                    created_at: Instant::now(),
                    generation,
                });
            }
        }

        // dispose() may have drained the registry between the liveness check and the insert
        if self.is_disposed() {
            if let Some((_, stream)) = self
                .streams
                .remove_if(request_id, |_, s| s.generation == generation)
            {
                stream.close(Err(RelayError::Disposed));
            }
            return Err(RelayError::Disposed);
        }

        debug!(request_id, instance_id, connection_id, "stream registered");
        self.bus.publish(
            Event::new(EventKind::StreamRegistered)
                .with_request(request_id)
                .with_instance(instance_id)
                .with_reason(connection_id),
        );
        Ok(StreamAdmission {
            ready,
            ready_rx,
            generation,
        })
    }

    /// Waits until the invoker completes, the stream is settled, or the caller gives up.
    ///
    /// The invoker runs on its own task and always runs to completion, even
    /// when the stream is settled before it returns.
    pub(super) async fn drive_invoker(
        &self,
        request_id: &str,
        admission: StreamAdmission,
        invoker: Invoker,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), RelayError> {
        let StreamAdmission {
            ready,
            ready_rx,
            generation,
        } = admission;
        let started = Instant::now();

        let invoked = tokio::spawn(async move {
            AssertUnwindSafe(async move { invoker().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(DispatchError::fail("stream invoker panicked")))
        });

        let outcome = tokio::select! {
            res = invoked => res
                .unwrap_or_else(|_| Err(DispatchError::fail("stream invoker aborted")))
                .map_err(|e| e.into_relay(request_id)),
            res = ready_rx => {
                // already settled by whoever tore the stream down
                return res.unwrap_or(Err(RelayError::Canceled {
                    request_id: request_id.to_string(),
                }));
            }
            _ = caller_cancelled(cancel) => Err(RelayError::Timeout {
                request_id: request_id.to_string(),
                elapsed: started.elapsed(),
            }),
        };

        match outcome {
            Ok(()) => {
                ready.resolve(Ok(()));
                Ok(())
            }
            Err(err) => {
                warn!(request_id, error = %err, "stream invocation did not succeed");
                self.bus.publish(
                    Event::new(EventKind::StreamFailed)
                        .with_request(request_id)
                        .with_reason(err.to_string()),
                );
                self.cleanup_stream(request_id, generation, Err(err.clone()))
                    .await;
                Err(err)
            }
        }
    }

    /// Removes a stream (same generation only), closes its buffer with `outcome`,
    /// and stops its monitor.
    pub(super) async fn cleanup_stream(
        &self,
        request_id: &str,
        generation: u64,
        outcome: Readiness,
    ) {
        if let Some((_, stream)) = self
            .streams
            .remove_if(request_id, |_, s| s.generation == generation)
        {
            stream.close(outcome);
        }

        let monitor = self
            .monitors
            .remove_if(request_id, |_, m| m.generation == generation);
        if let Some((_, monitor)) = monitor {
            monitor.cancel.cancel();
            if time::timeout(MONITOR_STOP_TIMEOUT, monitor.join)
                .await
                .is_err()
            {
                warn!(
                    request_id,
                    timeout_secs = MONITOR_STOP_TIMEOUT.as_secs(),
                    "stream monitor did not stop in time"
                );
            }
        }
    }

    /// Starts the timeout monitor for one stream registration.
    fn spawn_monitor(&self, request_id: &str, generation: u64) {
        if self.monitors.len() >= self.cfg.max_timeout_monitors {
            warn!(
                request_id,
                monitors = self.monitors.len(),
                max = self.cfg.max_timeout_monitors,
                "timeout monitor limit reached; starting monitor anyway"
            );
        }

        let cancel = self.runtime_token.child_token();
        let token = cancel.clone();
        let weak = self.this.clone();
        let id = request_id.to_string();
        let timeout = self.cfg.default_timeout;

        let join = tokio::spawn(async move {
            let expired = tokio::select! {
                _ = token.cancelled() => false,
                _ = time::sleep(timeout) => true,
            };
            let Some(me) = weak.upgrade() else { return };
            if expired {
                me.expire_stream(&id, generation, timeout);
            }
            me.monitors.remove_if(&id, |_, m| m.generation == generation);
        });

        let previous = self.monitors.insert(
            request_id.to_string(),
            Monitor {
                cancel,
                join,
                generation,
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
    }

    fn expire_stream(&self, request_id: &str, generation: u64, elapsed: Duration) {
        let Some((_, stream)) = self
            .streams
            .remove_if(request_id, |_, s| s.generation == generation)
        else {
            return;
        };

        warn!(
            request_id,
            instance_id = %stream.instance_id,
            connection_id = %stream.connection_id,
            elapsed_ms = elapsed.as_millis() as u64,
            "stream timed out"
        );
        stream.close(Err(RelayError::Timeout {
            request_id: request_id.to_string(),
            elapsed,
        }));
        self.bus.publish(
            Event::new(EventKind::StreamTimedOut)
                .with_request(request_id)
                .with_instance(stream.instance_id.as_str())
                .with_elapsed(elapsed),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    async fn sent() -> Result<(), DispatchError> {
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_starts_one_monitor() {
        let manager = TaskManager::new(Config::default()).unwrap();
        let _reader = manager
            .channel_stream_response::<String, _, _>("inst", "conn", "s-1", sent, None)
            .await
            .unwrap();

        assert_eq!(manager.pending_streams(), 1);
        assert_eq!(manager.active_monitors(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_removes_stream_and_monitor() {
        let manager = TaskManager::new(Config::default()).unwrap();
        let mut reader = manager
            .channel_stream_response::<u32, _, _>("inst", "conn", "s-2", sent, None)
            .await
            .unwrap();

        let source = futures::stream::iter(vec![Ok::<_, String>(7u32)]);
        manager
            .set_channel_stream_result("s-2", source)
            .await
            .unwrap();

        assert_eq!(manager.pending_streams(), 0);
        assert_eq!(manager.active_monitors(), 0);
        assert_eq!(reader.recv().await, Some(Ok(7)));
        assert_eq!(reader.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_connection_id_rejected() {
        let manager = TaskManager::new(Config::default()).unwrap();
        let res = manager
            .channel_stream_response::<u32, _, _>("inst", "  ", "s-3", sent, None)
            .await;
        assert!(matches!(
            res,
            Err(RelayError::InvalidArgument {
                field: "connection_id"
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_type_mismatch_is_ignored() {
        let manager = TaskManager::new(Config::default()).unwrap();
        let _reader = manager
            .channel_stream_response::<u32, _, _>("inst", "conn", "s-4", sent, None)
            .await
            .unwrap();

        let source = futures::stream::iter(vec![Ok::<_, String>("text")]);
        manager
            .set_channel_stream_result("s-4", source)
            .await
            .unwrap();
        assert_eq!(manager.pending_streams(), 1);
    }
}
