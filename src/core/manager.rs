//! # TaskManager: owns registries, queues, monitors and background passes.
//!
//! The [`TaskManager`] is one long-lived object constructed from a validated
//! [`Config`] and explicitly disposed. It is injected where needed (`Arc`), never
//! a process-wide singleton.
//!
//! ## Background passes
//! ```text
//! TaskManager::new(cfg)
//!   ├─► spawn_periodic(queue_poll_interval)    ─► process_queues()   (queue_lock, try_lock)
//!   └─► spawn_periodic(health_check_interval)  ─► run_health_check() (health_lock, try_lock)
//!
//! Both loops hold Weak<TaskManager> and stop on runtime_token cancellation
//! (dispose() or Drop). A tick that finds the previous pass still running is skipped.
//! ```
//!
//! ## Disposal
//! ```text
//! dispose()
//!   ├─► disposed = true (single-shot)
//!   ├─► runtime_token.cancel()        → loops stop, monitors wake up
//!   ├─► pending tasks   → Canceled
//!   ├─► pending streams → writer.fail(Disposed), readiness rejected
//!   ├─► queued entries  → Disposed
//!   └─► wait ≤ DISPOSAL_TIMEOUT for monitors → publish Disposed
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ConfigError, RelayError};
use crate::events::{Bus, Event, EventKind};

use super::queue::{QueuedStream, QueuedTask};
use super::streams::{ManagedStream, Monitor};
use super::tasks::ManagedTask;

/// Upper bound on waiting for timeout monitors during disposal.
pub const DISPOSAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Correlates fire-and-forget dispatches with results and streams delivered out-of-band.
///
/// See the crate documentation for the full lifecycle.
pub struct TaskManager {
    pub(super) cfg: Config,
    pub(super) bus: Bus,

    pub(super) tasks: DashMap<String, ManagedTask>,
    pub(super) streams: DashMap<String, ManagedStream>,
    pub(super) monitors: DashMap<String, Monitor>,

    pub(super) task_queue: Mutex<VecDeque<QueuedTask>>,
    pub(super) stream_queue: Mutex<VecDeque<QueuedStream>>,

    pub(super) health_lock: tokio::sync::Mutex<()>,
    pub(super) queue_lock: tokio::sync::Mutex<()>,

    pub(super) runtime_token: CancellationToken,
    pub(super) this: Weak<TaskManager>,
    generation: AtomicU64,
    pub(super) disposed: AtomicBool,
}

impl TaskManager {
    /// Validates `cfg`, builds the manager and starts its background passes.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(cfg: Config) -> Result<Arc<Self>, ConfigError> {
        cfg.validate()?;

        let manager = Arc::new_cyclic(|this| Self {
            bus: Bus::new(cfg.bus_capacity_clamped()),
            tasks: DashMap::new(),
            streams: DashMap::new(),
            monitors: DashMap::new(),
            task_queue: Mutex::new(VecDeque::new()),
            stream_queue: Mutex::new(VecDeque::new()),
            health_lock: tokio::sync::Mutex::new(()),
            queue_lock: tokio::sync::Mutex::new(()),
            runtime_token: CancellationToken::new(),
            this: this.clone(),
            generation: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            cfg,
        });

        manager.spawn_periodic(manager.cfg.queue_poll_interval, |me| {
            me.process_queues();
        });
        manager.spawn_periodic(manager.cfg.health_check_interval, |me| {
            me.run_health_check();
        });

        info!(
            health_check_secs = manager.cfg.health_check_interval.as_secs_f64(),
            max_tasks = manager.cfg.max_pending_tasks,
            max_streams = manager.cfg.max_pending_streams,
            default_timeout_secs = manager.cfg.default_timeout.as_secs_f64(),
            "task manager initialized"
        );
        Ok(manager)
    }

    /// Returns the active configuration.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Creates a receiver for runtime events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// Number of registered (not queued) tasks.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Number of registered (not queued) streams.
    pub fn pending_streams(&self) -> usize {
        self.streams.len()
    }

    /// Number of tasks waiting for admission.
    pub fn queued_tasks(&self) -> usize {
        lock(&self.task_queue).len()
    }

    /// Number of streams waiting for admission.
    pub fn queued_streams(&self) -> usize {
        lock(&self.stream_queue).len()
    }

    /// Number of tracked stream timeout monitors.
    pub fn active_monitors(&self) -> usize {
        self.monitors.len()
    }

    /// Returns true once [`dispose`](Self::dispose) has started.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Drains all pending work and stops background passes.
    ///
    /// Idempotent; never fails. Every pending task resolves as cancelled, every
    /// pending stream is closed with [`RelayError::Disposed`], every queued request
    /// is rejected with [`RelayError::Disposed`].
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.runtime_token.cancel();

        let task_ids: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for id in task_ids {
            if let Some((id, task)) = self.tasks.remove(&id) {
                task.slot.resolve(Err(RelayError::Canceled {
                    request_id: id.clone(),
                }));
                self.bus
                    .publish(Event::new(EventKind::TaskCanceled).with_request(id));
            }
        }

        let stream_ids: Vec<String> = self.streams.iter().map(|e| e.key().clone()).collect();
        for id in stream_ids {
            if let Some((_, stream)) = self.streams.remove(&id) {
                stream.close(Err(RelayError::Disposed));
            }
        }

        let queued_tasks: Vec<QueuedTask> = lock(&self.task_queue).drain(..).collect();
        for entry in queued_tasks {
            entry.slot.resolve(Err(RelayError::Disposed));
        }
        let queued_streams: Vec<QueuedStream> = lock(&self.stream_queue).drain(..).collect();
        for entry in queued_streams {
            entry.writer.fail(RelayError::Disposed);
            entry.slot.resolve(Err(RelayError::Disposed));
        }

        let monitor_ids: Vec<String> = self.monitors.iter().map(|e| e.key().clone()).collect();
        let joins: Vec<_> = monitor_ids
            .iter()
            .filter_map(|id| self.monitors.remove(id))
            .map(|(_, m)| {
                m.cancel.cancel();
                m.join
            })
            .collect();
        if time::timeout(DISPOSAL_TIMEOUT, futures::future::join_all(joins))
            .await
            .is_err()
        {
            warn!(
                timeout_secs = DISPOSAL_TIMEOUT.as_secs(),
                "some timeout monitors did not complete during disposal"
            );
        }

        self.bus.publish(Event::new(EventKind::Disposed));
        info!("task manager disposed");
    }

    /// Fails fast once disposal has started.
    pub(super) fn ensure_live(&self) -> Result<(), RelayError> {
        if self.is_disposed() {
            return Err(RelayError::Disposed);
        }
        Ok(())
    }

    /// Next registration generation; distinguishes reuses of the same request id.
    pub(super) fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(super) fn has_task_capacity(&self) -> bool {
        self.tasks.len() < self.cfg.max_pending_tasks
    }

    pub(super) fn has_stream_capacity(&self) -> bool {
        self.streams.len() < self.cfg.max_pending_streams
    }

    /// Runs `pass` every `period` until the runtime token is cancelled or the manager is dropped.
    fn spawn_periodic<F>(&self, period: Duration, pass: F)
    where
        F: Fn(&Arc<TaskManager>) + Send + 'static,
    {
        let weak = self.this.clone();
        let token = self.runtime_token.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(me) = weak.upgrade() else { break };
                        pass(&me);
                    }
                }
            }
            debug!(period_ms = period.as_millis() as u64, "background pass stopped");
        });
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.runtime_token.cancel();
    }
}

/// Rejects blank identifiers before anything is registered.
pub(super) fn validate_ids(instance_id: &str, request_id: &str) -> Result<(), RelayError> {
    if instance_id.trim().is_empty() {
        return Err(RelayError::InvalidArgument {
            field: "instance_id",
        });
    }
    if request_id.trim().is_empty() {
        return Err(RelayError::InvalidArgument {
            field: "request_id",
        });
    }
    Ok(())
}

/// Completes when the caller's token is cancelled; never completes without one.
pub(super) async fn caller_cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Locks a queue, recovering from poisoning (queue state stays consistent per operation).
pub(super) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
