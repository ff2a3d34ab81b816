//! # Admission queues for requests that arrive while a registry is full.
//!
//! When `tasks.len() >= max_pending_tasks` (or the stream equivalent) a request is
//! parked in a FIFO queue instead of being rejected. The caller awaits the queue
//! entry's own slot; a periodic pass promotes entries once capacity frees up.
//!
//! ## Processing pass
//! ```text
//! process_queues()                      (queue_lock.try_lock, skipped if busy)
//!   for each queue, at most MAX_PROCESSING_BATCH entries:
//!     pop_front()
//!       ├─ caller gone / cancelled      → drop
//!       ├─ waited > max_queue_wait      → QueueTimeout, drop
//!       ├─ registry still full          → push_front, stop this queue
//!       └─ promote                      → register now, wait on a spawned task,
//!                                         forward the outcome into the queued slot
//! ```
//!
//! ## Rules
//! - FIFO order is preserved: a blocked head is pushed back to the front.
//! - Registration happens inside the pass so capacity accounting stays exact.
//! - A request id is never in a registry and its queue at the same time.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::ErasedWriter;
use crate::error::RelayError;
use crate::events::{Event, EventKind};

use super::manager::{TaskManager, caller_cancelled, lock};
use super::slot::{Slot, slot};
use super::streams::{Invoker, Readiness};
use super::tasks::{Dispatch, TaskOutcome, check_type};

/// Upper bound of entries handled per queue per pass.
pub const MAX_PROCESSING_BATCH: usize = 10;

/// Task request waiting for registry capacity.
pub(crate) struct QueuedTask {
    pub(super) instance_id: String,
    pub(super) request_id: String,
    pub(super) response_type: &'static str,
    pub(super) dispatch: Dispatch,
    pub(super) cancel: Option<CancellationToken>,
    pub(super) slot: Slot<TaskOutcome>,
    pub(super) enqueued_at: Instant,
}

/// Stream request waiting for registry capacity.
pub(crate) struct QueuedStream {
    pub(super) instance_id: String,
    pub(super) connection_id: String,
    pub(super) request_id: String,
    pub(super) writer: Arc<dyn ErasedWriter>,
    pub(super) invoker: Invoker,
    pub(super) cancel: Option<CancellationToken>,
    pub(super) slot: Slot<Readiness>,
    pub(super) enqueued_at: Instant,
}

/// Summary of one queue processing pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueReport {
    /// Tasks moved into the registry.
    pub promoted_tasks: usize,
    /// Streams moved into the registry.
    pub promoted_streams: usize,
    /// Entries rejected for waiting longer than `max_queue_wait`.
    pub expired: usize,
    /// Entries whose caller had already given up.
    pub abandoned: usize,
    /// True if the pass did not run because another one was in progress.
    pub skipped: bool,
}

/// Outcome of inspecting the head of a queue.
enum Verdict {
    Abandoned,
    Expired(Duration),
    Blocked,
    Promote(Duration),
}

impl TaskManager {
    /// Runs one admission pass over both queues.
    ///
    /// Called periodically every `queue_poll_interval`; may also be called directly.
    pub fn process_queues(&self) -> QueueReport {
        let Ok(_pass) = self.queue_lock.try_lock() else {
            debug!("queue pass already running; tick skipped");
            return QueueReport {
                skipped: true,
                ..QueueReport::default()
            };
        };
        let mut report = QueueReport::default();
        if self.is_disposed() {
            return report;
        }

        self.process_task_queue(&mut report);
        self.process_stream_queue(&mut report);

        if report != QueueReport::default() {
            debug!(
                promoted_tasks = report.promoted_tasks,
                promoted_streams = report.promoted_streams,
                expired = report.expired,
                abandoned = report.abandoned,
                queued_tasks = self.queued_tasks(),
                queued_streams = self.queued_streams(),
                "queue pass finished"
            );
        }
        report
    }

    /// Parks a task request and waits for its promoted outcome.
    pub(super) async fn enqueue_task(
        &self,
        instance_id: &str,
        request_id: &str,
        response_type: &'static str,
        dispatch: Dispatch,
        cancel: Option<CancellationToken>,
    ) -> TaskOutcome {
        if self.tasks.contains_key(request_id) {
            return Err(already_pending(request_id));
        }
        let (slot, rx) = slot();
        {
            let mut queue = lock(&self.task_queue);
            if queue.iter().any(|q| q.request_id == request_id) {
                return Err(already_pending(request_id));
            }
            queue.push_back(QueuedTask {
                instance_id: instance_id.to_string(),
                request_id: request_id.to_string(),
                response_type,
                dispatch,
                cancel: cancel.clone(),
                slot,
                enqueued_at: Instant::now(),
            });
        }
        if self.is_disposed() {
            // raced dispose(): roll back the entry if it was not drained already
            self.remove_queued_task(request_id);
            return Err(RelayError::Disposed);
        }

        info!(
            request_id,
            instance_id,
            pending = self.tasks.len(),
            max = self.cfg.max_pending_tasks,
            "task capacity reached; request queued"
        );
        self.bus.publish(
            Event::new(EventKind::TaskQueued)
                .with_request(request_id)
                .with_instance(instance_id),
        );

        let started = Instant::now();
        tokio::select! {
            res = rx => res.unwrap_or_else(|_| Err(RelayError::Canceled {
                request_id: request_id.to_string(),
            })),
            _ = caller_cancelled(cancel.as_ref()) => {
                self.remove_queued_task(request_id);
                Err(RelayError::Timeout {
                    request_id: request_id.to_string(),
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    /// Parks a stream request and waits until it has been registered and invoked.
    pub(super) async fn enqueue_stream(
        &self,
        instance_id: &str,
        connection_id: &str,
        request_id: &str,
        writer: Arc<dyn ErasedWriter>,
        invoker: Invoker,
        cancel: Option<CancellationToken>,
    ) -> Readiness {
        if self.streams.contains_key(request_id) {
            return Err(already_pending(request_id));
        }
        let (slot, rx) = slot();
        {
            let mut queue = lock(&self.stream_queue);
            if queue.iter().any(|q| q.request_id == request_id) {
                return Err(already_pending(request_id));
            }
            queue.push_back(QueuedStream {
                instance_id: instance_id.to_string(),
                connection_id: connection_id.to_string(),
                request_id: request_id.to_string(),
                writer,
                invoker,
                cancel: cancel.clone(),
                slot,
                enqueued_at: Instant::now(),
            });
        }
        if self.is_disposed() {
            if let Some(entry) = self.remove_queued_stream(request_id) {
                entry.writer.fail(RelayError::Disposed);
            }
            return Err(RelayError::Disposed);
        }

        info!(
            request_id,
            instance_id,
            connection_id,
            pending = self.streams.len(),
            max = self.cfg.max_pending_streams,
            "stream capacity reached; request queued"
        );
        self.bus.publish(
            Event::new(EventKind::StreamQueued)
                .with_request(request_id)
                .with_instance(instance_id),
        );

        let started = Instant::now();
        tokio::select! {
            res = rx => res.unwrap_or_else(|_| Err(RelayError::Canceled {
                request_id: request_id.to_string(),
            })),
            _ = caller_cancelled(cancel.as_ref()) => {
                let err = RelayError::Timeout {
                    request_id: request_id.to_string(),
                    elapsed: started.elapsed(),
                };
                if let Some(entry) = self.remove_queued_stream(request_id) {
                    entry.writer.fail(err.clone());
                }
                Err(err)
            }
        }
    }

    fn process_task_queue(&self, report: &mut QueueReport) {
        for _ in 0..MAX_PROCESSING_BATCH {
            let Some(entry) = lock(&self.task_queue).pop_front() else {
                break;
            };
            let abandoned = entry.cancel.as_ref().is_some_and(|t| t.is_cancelled())
                || entry.slot.is_abandoned();

            match self.verdict(abandoned, entry.enqueued_at, self.has_task_capacity()) {
                Verdict::Abandoned => {
                    debug!(request_id = %entry.request_id, "queued task abandoned by caller");
                    report.abandoned += 1;
                }
                Verdict::Expired(waited) => {
                    self.expire_entry(&entry.request_id, waited);
                    entry.slot.resolve(Err(RelayError::QueueTimeout {
                        request_id: entry.request_id,
                        waited,
                    }));
                    report.expired += 1;
                }
                Verdict::Blocked => {
                    lock(&self.task_queue).push_front(entry);
                    break;
                }
                Verdict::Promote(waited) => {
                    self.promote_task(entry, waited);
                    report.promoted_tasks += 1;
                }
            }
        }
    }

    fn process_stream_queue(&self, report: &mut QueueReport) {
        for _ in 0..MAX_PROCESSING_BATCH {
            let Some(entry) = lock(&self.stream_queue).pop_front() else {
                break;
            };
            let abandoned = entry.cancel.as_ref().is_some_and(|t| t.is_cancelled())
                || entry.slot.is_abandoned();

            match self.verdict(abandoned, entry.enqueued_at, self.has_stream_capacity()) {
                Verdict::Abandoned => {
                    debug!(request_id = %entry.request_id, "queued stream abandoned by caller");
                    entry.writer.fail(RelayError::Canceled {
                        request_id: entry.request_id,
                    });
                    report.abandoned += 1;
                }
                Verdict::Expired(waited) => {
                    self.expire_entry(&entry.request_id, waited);
                    let err = RelayError::QueueTimeout {
                        request_id: entry.request_id,
                        waited,
                    };
                    entry.writer.fail(err.clone());
                    entry.slot.resolve(Err(err));
                    report.expired += 1;
                }
                Verdict::Blocked => {
                    lock(&self.stream_queue).push_front(entry);
                    break;
                }
                Verdict::Promote(waited) => {
                    self.promote_stream(entry, waited);
                    report.promoted_streams += 1;
                }
            }
        }
    }

    fn verdict(&self, abandoned: bool, enqueued_at: Instant, has_capacity: bool) -> Verdict {
        let waited = enqueued_at.elapsed();
        if abandoned {
            Verdict::Abandoned
        } else if waited > self.cfg.max_queue_wait {
            Verdict::Expired(waited)
        } else if !has_capacity {
            Verdict::Blocked
        } else {
            Verdict::Promote(waited)
        }
    }

    fn expire_entry(&self, request_id: &str, waited: Duration) {
        warn!(
            request_id,
            waited_ms = waited.as_millis() as u64,
            "queued request expired"
        );
        self.bus.publish(
            Event::new(EventKind::QueueExpired)
                .with_request(request_id)
                .with_elapsed(waited),
        );
    }

    fn promote_task(&self, entry: QueuedTask, waited: Duration) {
        let QueuedTask {
            instance_id,
            request_id,
            response_type,
            dispatch,
            cancel,
            slot,
            ..
        } = entry;

        let registered = match self.register_task(&instance_id, &request_id) {
            Ok(registered) => registered,
            Err(err) => {
                warn!(request_id = %request_id, error = %err, "queued task could not be promoted");
                slot.resolve(Err(err));
                return;
            }
        };
        info!(
            request_id = %request_id,
            instance_id = %instance_id,
            waited_ms = waited.as_millis() as u64,
            "queued task promoted"
        );
        self.bus.publish(
            Event::new(EventKind::TaskPromoted)
                .with_request(request_id.as_str())
                .with_instance(instance_id.as_str())
                .with_elapsed(waited),
        );

        self.fire_dispatch(&request_id, registered.slot, dispatch);
        let Some(me) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let outcome = me
                .await_task(
                    &instance_id,
                    &request_id,
                    registered.generation,
                    registered.rx,
                    cancel.as_ref(),
                )
                .await
                .and_then(|result| {
                    check_type(&request_id, response_type, &result)?;
                    Ok(result)
                });
            slot.resolve(outcome);
        });
    }

    fn promote_stream(&self, entry: QueuedStream, waited: Duration) {
        let QueuedStream {
            instance_id,
            connection_id,
            request_id,
            writer,
            invoker,
            cancel,
            slot,
            ..
        } = entry;

        let admission = match self.register_stream(
            &instance_id,
            &connection_id,
            &request_id,
            Arc::clone(&writer),
        ) {
            Ok(admission) => admission,
            Err(err) => {
                warn!(request_id = %request_id, error = %err, "queued stream could not be promoted");
                writer.fail(err.clone());
                slot.resolve(Err(err));
                return;
            }
        };
        info!(
            request_id = %request_id,
            instance_id = %instance_id,
            waited_ms = waited.as_millis() as u64,
            "queued stream promoted"
        );
        self.bus.publish(
            Event::new(EventKind::StreamPromoted)
                .with_request(request_id.as_str())
                .with_instance(instance_id.as_str())
                .with_elapsed(waited),
        );

        let Some(me) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let outcome = me
                .drive_invoker(&request_id, admission, invoker, cancel.as_ref())
                .await;
            slot.resolve(outcome);
        });
    }

    fn remove_queued_task(&self, request_id: &str) -> Option<QueuedTask> {
        let mut queue = lock(&self.task_queue);
        let pos = queue.iter().position(|q| q.request_id == request_id)?;
        queue.remove(pos)
    }

    fn remove_queued_stream(&self, request_id: &str) -> Option<QueuedStream> {
        let mut queue = lock(&self.stream_queue);
        let pos = queue.iter().position(|q| q.request_id == request_id)?;
        queue.remove(pos)
    }
}

fn already_pending(request_id: &str) -> RelayError {
    RelayError::AlreadyPending {
        request_id: request_id.to_string(),
    }
}
