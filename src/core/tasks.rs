//! # Task correlation: dispatch now, result later.
//!
//! A task is a request whose answer arrives out-of-band. The caller registers a
//! completion slot under a request id, fires the dispatch, and suspends. Some
//! other party later calls [`TaskManager::set_task_result`] with the same id.
//!
//! ## Flow
//! ```text
//! external_execute(instance, request, dispatch, cancel)
//!   ├─► validate ids / disposed?
//!   ├─► capacity?  no ─► enqueue_task() ─► await queued slot (see queue.rs)
//!   ├─► register_task()        (AlreadyPending on duplicate id)
//!   ├─► fire_dispatch()        (own tokio task, panics caught)
//!   │     ├─ Ok(None)          → nothing (result comes externally)
//!   │     ├─ Ok(Some(result))  → slot resolved (execute() path)
//!   │     └─ Err / panic       → slot resolved with Dispatch / Canceled
//!   └─► await_task()           (slot vs default timeout vs caller token)
//!         └─ TaskGuard drops   → registry entry removed (same generation only)
//! ```
//!
//! ## Rules
//! - The slot resolves **once**; later results are ignored.
//! - The default timeout is always a ceiling; the caller token can only shorten it.
//! - Caller cancellation surfaces as [`RelayError::Timeout`]; the remote worker keeps running.
//! - Successful dispatch never resolves the slot on its own.

use std::any::type_name;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DispatchError, RelayError};
use crate::events::{Event, EventKind};
use crate::tracked::{AnyResult, Tracked};

use super::manager::{TaskManager, caller_cancelled, lock, validate_ids};
use super::slot::{Slot, slot};

/// Outcome delivered through a task slot.
pub(super) type TaskOutcome = Result<AnyResult, RelayError>;

/// Boxed dispatch action. `Some(result)` feeds the slot directly (the `execute` path).
pub(super) type Dispatch =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<Option<AnyResult>, DispatchError>> + Send>;

/// Registry entry of a pending task.
pub(crate) struct ManagedTask {
    pub(super) instance_id: String,
    pub(super) slot: Slot<TaskOutcome>,
    pub(super) created_at: Instant,
    pub(super) generation: u64,
}

/// Handle returned by a successful registration.
pub(super) struct Registered {
    pub(super) slot: Slot<TaskOutcome>,
    pub(super) rx: oneshot::Receiver<TaskOutcome>,
    pub(super) generation: u64,
}

impl TaskManager {
    /// Dispatches a request whose result will be delivered later through
    /// [`set_task_result`](Self::set_task_result).
    ///
    /// `dispatch` is invoked once, on its own task. Its `Ok(())` only means the
    /// request was sent; the caller keeps waiting for the external result. An
    /// `Err` (or a panic) fails the wait immediately.
    ///
    /// Fails with [`RelayError::Timeout`] after `default_timeout` or when `cancel`
    /// fires, whichever is first.
    pub async fn external_execute<R, F, Fut>(
        &self,
        instance_id: &str,
        request_id: &str,
        dispatch: F,
        cancel: Option<CancellationToken>,
    ) -> Result<R, RelayError>
    where
        R: Tracked,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        let dispatch: Dispatch =
            Box::new(move || dispatch().map(|res| res.map(|()| None)).boxed());
        let result = self
            .correlate(instance_id, request_id, type_name::<R>(), dispatch, cancel)
            .await?;
        downcast_result(request_id, result)
    }

    /// Like [`external_execute`](Self::external_execute), but the dispatch itself
    /// returns the result, which is delivered as if passed to `set_task_result`.
    pub async fn execute<R, F, Fut>(
        &self,
        instance_id: &str,
        request_id: &str,
        dispatch: F,
        cancel: Option<CancellationToken>,
    ) -> Result<R, RelayError>
    where
        R: Tracked,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, DispatchError>> + Send + 'static,
    {
        let id = request_id.to_string();
        let dispatch: Dispatch = Box::new(move || {
            async move {
                let mut result = dispatch().await?;
                result.set_request_id(id);
                Ok(Some(AnyResult::new(result)))
            }
            .boxed()
        });
        let result = self
            .correlate(instance_id, request_id, type_name::<R>(), dispatch, cancel)
            .await?;
        downcast_result(request_id, result)
    }

    /// Delivers the result for `request_id`.
    ///
    /// The request id is stamped into `result`. An unknown or already-resolved id
    /// is logged and ignored.
    pub fn set_task_result<R: Tracked>(
        &self,
        request_id: &str,
        mut result: R,
    ) -> Result<(), RelayError> {
        self.ensure_live()?;

        let slot = self.tasks.get(request_id).map(|t| t.slot.clone());
        let Some(slot) = slot else {
            warn!(request_id, "no pending task found for result");
            self.bus.publish(
                Event::new(EventKind::UnknownRequest)
                    .with_request(request_id)
                    .with_reason("set_task_result"),
            );
            return Ok(());
        };

        result.set_request_id(request_id.to_string());
        if slot.resolve(Ok(AnyResult::new(result))) {
            debug!(request_id, "task result delivered");
            self.bus
                .publish(Event::new(EventKind::TaskCompleted).with_request(request_id));
        } else {
            debug!(request_id, "task already resolved; result ignored");
        }
        Ok(())
    }

    /// Cancels a pending or queued task; its caller fails with [`RelayError::Canceled`].
    ///
    /// Unknown ids are logged. No-op after disposal.
    pub fn cancel_task(&self, request_id: &str) {
        if self.is_disposed() {
            return;
        }

        if let Some((_, task)) = self.tasks.remove(request_id) {
            task.slot.resolve(Err(RelayError::Canceled {
                request_id: request_id.to_string(),
            }));
            info!(request_id, instance_id = %task.instance_id, "task cancelled");
            self.bus.publish(
                Event::new(EventKind::TaskCanceled)
                    .with_request(request_id)
                    .with_instance(task.instance_id),
            );
            return;
        }

        let queued = {
            let mut queue = lock(&self.task_queue);
            queue
                .iter()
                .position(|q| q.request_id == request_id)
                .and_then(|pos| queue.remove(pos))
        };
        if let Some(entry) = queued {
            entry.slot.resolve(Err(RelayError::Canceled {
                request_id: request_id.to_string(),
            }));
            info!(request_id, instance_id = %entry.instance_id, "queued task cancelled");
            self.bus.publish(
                Event::new(EventKind::TaskCanceled)
                    .with_request(request_id)
                    .with_instance(entry.instance_id),
            );
            return;
        }

        warn!(request_id, "no pending task found to cancel");
        self.bus.publish(
            Event::new(EventKind::UnknownRequest)
                .with_request(request_id)
                .with_reason("cancel_task"),
        );
    }

    /// Returns the instance id that owns a registered request.
    ///
    /// Requests still waiting in the admission queue are not visible.
    pub fn request_instance_id(&self, request_id: &str) -> Result<String, RelayError> {
        self.ensure_live()?;
        self.tasks
            .get(request_id)
            .map(|t| t.instance_id.clone())
            .ok_or_else(|| RelayError::NotFound {
                request_id: request_id.to_string(),
            })
    }

    /// Register-or-queue, dispatch, and wait.
    async fn correlate(
        &self,
        instance_id: &str,
        request_id: &str,
        response_type: &'static str,
        dispatch: Dispatch,
        cancel: Option<CancellationToken>,
    ) -> TaskOutcome {
        self.ensure_live()?;
        validate_ids(instance_id, request_id)?;

        if !self.has_task_capacity() {
            return self
                .enqueue_task(instance_id, request_id, response_type, dispatch, cancel)
                .await;
        }

        let registered = self.register_task(instance_id, request_id)?;
        self.fire_dispatch(request_id, registered.slot, dispatch);
        self.await_task(
            instance_id,
            request_id,
            registered.generation,
            registered.rx,
            cancel.as_ref(),
        )
        .await
    }

    /// Inserts a fresh slot under `request_id`. Never overwrites.
    pub(super) fn register_task(
        &self,
        instance_id: &str,
        request_id: &str,
    ) -> Result<Registered, RelayError> {
        let queued = lock(&self.task_queue)
            .iter()
            .any(|q| q.request_id == request_id);
        if queued {
            return Err(RelayError::AlreadyPending {
                request_id: request_id.to_string(),
            });
        }

        let (slot, rx) = slot();
        let generation = self.next_generation();
        match self.tasks.entry(request_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(RelayError::AlreadyPending {
                    request_id: request_id.to_string(),
                });
            }
            Entry::Vacant(v) => {
                v.insert(ManagedTask {
                    instance_id: instance_id.to_string(),
                    slot: slot.clone(),
                    created_at: Instant::now(),
                    generation,
                });
            }
        }

        // dispose() may have drained the registry between the liveness check and the insert
        if self.is_disposed() {
            if let Some((_, task)) = self
                .tasks
                .remove_if(request_id, |_, t| t.generation == generation)
            {
                task.slot.resolve(Err(RelayError::Disposed));
            }
            return Err(RelayError::Disposed);
        }

        debug!(request_id, instance_id, "task registered");
        self.bus.publish(
            Event::new(EventKind::TaskRegistered)
                .with_request(request_id)
                .with_instance(instance_id),
        );
        Ok(Registered {
            slot,
            rx,
            generation,
        })
    }

    /// Runs the dispatch on its own task and feeds non-success outcomes into `slot`.
    pub(super) fn fire_dispatch(
        &self,
        request_id: &str,
        slot: Slot<TaskOutcome>,
        dispatch: Dispatch,
    ) {
        let bus = self.bus.clone();
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(async move { dispatch().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(DispatchError::fail("dispatch panicked")));

            match outcome {
                Ok(None) => {}
                Ok(Some(result)) => {
                    if slot.resolve(Ok(result)) {
                        bus.publish(Event::new(EventKind::TaskCompleted).with_request(request_id));
                    }
                }
                Err(err) => {
                    let kind = match err {
                        DispatchError::Canceled => EventKind::TaskCanceled,
                        _ => EventKind::TaskFailed,
                    };
                    warn!(request_id = %request_id, error = %err, "task dispatch did not succeed");
                    let reason = err.to_string();
                    if slot.resolve(Err(err.into_relay(&request_id))) {
                        bus.publish(
                            Event::new(kind)
                                .with_request(request_id)
                                .with_reason(reason),
                        );
                    }
                }
            }
        });
    }

    /// Waits for the slot, bounded by the default timeout and the caller token.
    ///
    /// The registry entry is removed when this future completes or is dropped.
    pub(super) async fn await_task(
        &self,
        instance_id: &str,
        request_id: &str,
        generation: u64,
        rx: oneshot::Receiver<TaskOutcome>,
        cancel: Option<&CancellationToken>,
    ) -> TaskOutcome {
        let _guard = TaskGuard {
            tasks: &self.tasks,
            request_id,
            generation,
        };
        let started = Instant::now();

        let received = tokio::select! {
            res = rx => Some(res),
            _ = time::sleep(self.cfg.default_timeout) => None,
            _ = caller_cancelled(cancel) => None,
        };

        match received {
            Some(Ok(outcome)) => outcome,
            Some(Err(_)) => Err(RelayError::Canceled {
                request_id: request_id.to_string(),
            }),
            None => {
                let elapsed = started.elapsed();
                warn!(
                    request_id,
                    instance_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "task timed out"
                );
                self.bus.publish(
                    Event::new(EventKind::TaskTimedOut)
                        .with_request(request_id)
                        .with_instance(instance_id)
                        .with_elapsed(elapsed),
                );
                Err(RelayError::Timeout {
                    request_id: request_id.to_string(),
                    elapsed,
                })
            }
        }
    }
}

/// Removes a task entry on scope exit, unless a newer registration took its id.
struct TaskGuard<'a> {
    tasks: &'a DashMap<String, ManagedTask>,
    request_id: &'a str,
    generation: u64,
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        self.tasks
            .remove_if(self.request_id, |_, t| t.generation == self.generation);
    }
}

/// Fails with [`RelayError::TypeMismatch`] unless `result` holds `expected`.
pub(super) fn check_type(
    request_id: &str,
    expected: &'static str,
    result: &AnyResult,
) -> Result<(), RelayError> {
    if result.type_name() == expected {
        return Ok(());
    }
    error!(
        request_id,
        expected,
        actual = result.type_name(),
        "result type does not match the awaited type"
    );
    Err(RelayError::TypeMismatch {
        request_id: request_id.to_string(),
        expected,
        actual: result.type_name(),
    })
}

fn downcast_result<R: Tracked>(request_id: &str, result: AnyResult) -> Result<R, RelayError> {
    check_type(request_id, type_name::<R>(), &result)?;
    result.downcast::<R>().map_err(|other| RelayError::TypeMismatch {
        request_id: request_id.to_string(),
        expected: type_name::<R>(),
        actual: other.type_name(),
    })
}
