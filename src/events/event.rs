//! # Runtime events emitted by the task manager.
//!
//! The [`EventKind`] enum classifies event types across four categories:
//! - **Task events**: registration, queueing, completion and failure of correlated tasks
//! - **Stream events**: the same lifecycle for relay streams
//! - **Maintenance events**: queue expiry, orphan reaping, resource pressure, health passes
//! - **Shutdown events**: disposal
//!
//! The [`Event`] struct carries metadata such as timestamps, request/instance ids,
//! reasons and elapsed durations.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//! Use `seq` to restore the exact order when events are delivered out of order.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use taskrelay::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::TaskTimedOut)
//!     .with_request("req-1")
//!     .with_instance("instance-a")
//!     .with_elapsed(Duration::from_secs(5));
//!
//! assert_eq!(ev.kind, EventKind::TaskTimedOut);
//! assert_eq!(ev.request_id.as_deref(), Some("req-1"));
//! assert_eq!(ev.elapsed_ms, Some(5_000));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Task events ===
    /// Task registered and its dispatch fired.
    ///
    /// Sets: `request_id`, `instance_id`
    TaskRegistered,

    /// Task capacity exhausted; request placed in the admission queue.
    ///
    /// Sets: `request_id`, `instance_id`
    TaskQueued,

    /// Queued task promoted into the registry.
    ///
    /// Sets: `request_id`, `instance_id`, `elapsed_ms` (time spent queued)
    TaskPromoted,

    /// External result delivered to a pending task.
    ///
    /// Sets: `request_id`
    TaskCompleted,

    /// Dispatch of a task failed (or panicked).
    ///
    /// Sets: `request_id`, `reason`
    TaskFailed,

    /// Task wait exceeded the default timeout or the caller's cancellation.
    ///
    /// Sets: `request_id`, `instance_id`, `elapsed_ms`
    TaskTimedOut,

    /// Task cancelled (explicit cancel, dispatch cancellation or disposal).
    ///
    /// Sets: `request_id`
    TaskCanceled,

    // === Stream events ===
    /// Stream registered and its timeout monitor started.
    ///
    /// Sets: `request_id`, `instance_id`, `reason` (connection id)
    StreamRegistered,

    /// Stream capacity exhausted; request placed in the admission queue.
    ///
    /// Sets: `request_id`, `instance_id`
    StreamQueued,

    /// Queued stream promoted into the registry.
    ///
    /// Sets: `request_id`, `instance_id`, `elapsed_ms` (time spent queued)
    StreamPromoted,

    /// External source fully relayed into the stream buffer.
    ///
    /// Sets: `request_id`
    StreamCompleted,

    /// Stream invoker or external source failed.
    ///
    /// Sets: `request_id`, `reason`
    StreamFailed,

    /// Stream exceeded the default timeout; its buffer was closed with an error.
    ///
    /// Sets: `request_id`, `elapsed_ms`
    StreamTimedOut,

    // === Maintenance events ===
    /// Queued request waited longer than `max_queue_wait` and was dropped.
    ///
    /// Sets: `request_id`, `elapsed_ms` (time spent queued)
    QueueExpired,

    /// Reaper force-failed a task older than the orphan threshold.
    ///
    /// Sets: `request_id`, `elapsed_ms` (task age)
    TaskOrphaned,

    /// Reaper removed a stream that had no timeout monitor.
    ///
    /// Sets: `request_id`
    StreamOrphaned,

    /// A result, stream or cancellation referenced an id with no pending entry.
    ///
    /// Sets: `request_id`, `reason` (operation)
    UnknownRequest,

    /// Registry occupancy crossed the warning ratio.
    ///
    /// Sets: `reason` (occupancy summary)
    ResourcePressure,

    /// Health check pass finished.
    ///
    /// Sets: `reason` (cleanup summary)
    HealthCheckCompleted,

    // === Shutdown events ===
    /// Task manager disposed; all pending work drained.
    Disposed,
}

/// Runtime event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Request id, if applicable.
    pub request_id: Option<Arc<str>>,
    /// Owning instance id, if applicable.
    pub instance_id: Option<Arc<str>>,
    /// Human-readable reason (errors, summaries, etc.).
    pub reason: Option<Arc<str>>,
    /// Elapsed time in milliseconds (wait, queue time or age).
    pub elapsed_ms: Option<u64>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            request_id: None,
            instance_id: None,
            reason: None,
            elapsed_ms: None,
        }
    }

    /// Attaches a request id.
    #[inline]
    pub fn with_request(mut self, id: impl Into<Arc<str>>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Attaches an instance id.
    #[inline]
    pub fn with_instance(mut self, id: impl Into<Arc<str>>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches an elapsed duration (stored as milliseconds).
    #[inline]
    pub fn with_elapsed(mut self, d: Duration) -> Self {
        self.elapsed_ms = Some(d.as_millis().min(u128::from(u64::MAX)) as u64);
        self
    }

    /// Returns true if the event refers to `request_id`.
    #[inline]
    pub fn is_for(&self, request_id: &str) -> bool {
        self.request_id.as_deref() == Some(request_id)
    }
}
