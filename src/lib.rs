//! # taskrelay
//!
//! **Taskrelay** correlates fire-and-forget dispatches with results that arrive
//! later, out-of-band, keyed by a request id.
//!
//! A caller sends a request to some remote worker and suspends. The answer comes
//! back through a different path (a message handler, a webhook, another
//! connection) which hands it to the [`TaskManager`] with the same request id.
//! The manager wakes the right caller, enforces timeouts, queues requests when
//! its registries are full, and reaps whatever every other path missed.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   caller A                caller B                     remote side
//!  external_execute()     channel_stream_response()     set_task_result()
//!        │                       │                      set_channel_stream_result()
//!        ▼                       ▼                               │
//! ┌───────────────────────────────────────────────────────────────┼──────┐
//! │  TaskManager                                                  │      │
//! │   tasks:    DashMap<request_id, ManagedTask>   ◄──────────────┤      │
//! │   streams:  DashMap<request_id, ManagedStream> ◄──────────────┘      │
//! │   monitors: DashMap<request_id, Monitor>   (one per stream)          │
//! │   task_queue / stream_queue: FIFO when a registry is full            │
//! │                                                                      │
//! │   every queue_poll_interval    ─► process_queues()                   │
//! │   every health_check_interval  ─► run_health_check()                 │
//! └──────────────────────────────────┬───────────────────────────────────┘
//!                                    ▼
//!                       Bus (broadcast channel of Event)
//!                                    ▼
//!                          TaskManager::subscribe()
//! ```
//!
//! ### Task lifecycle
//! ```text
//! register ──► dispatch (spawned) ──► wait
//!                                      ├─ set_task_result()      → Ok(result, request id stamped)
//!                                      ├─ dispatch Err / panic   → Dispatch / Canceled
//!                                      ├─ cancel_task()          → Canceled
//!                                      ├─ default_timeout        → Timeout
//!                                      ├─ caller token           → Timeout
//!                                      ├─ reaper (2× timeout)    → Orphaned
//!                                      └─ dispose()              → Canceled
//!          ──► entry removed
//! ```
//!
//! ### Stream lifecycle
//! ```text
//! register + monitor ──► invoker ──► reader returned to caller
//!                                       │
//!   set_channel_stream_result(source) ──┤ items copied into buffer
//!                                       ├─ source ends       → reader ends
//!                                       ├─ source fails      → Err(Stream) item
//!                                       ├─ default_timeout   → Err(Timeout) item
//!                                       └─ dispose()         → Err(Disposed) item
//! ```
//!
//! ## Features
//! | Area              | Description                                                  | Key types / traits                     |
//! |-------------------|--------------------------------------------------------------|----------------------------------------|
//! | **Correlation**   | Dispatch now, await a result delivered later by request id.  | [`TaskManager`], [`Tracked`]           |
//! | **Streams**       | Hand out a reader now, feed it from an external source.      | [`RelayStream`]                        |
//! | **Admission**     | FIFO queues when registries are full, with bounded wait.     | [`QueueReport`]                        |
//! | **Maintenance**   | Orphan reaper and resource pressure reporting.               | [`HealthReport`]                       |
//! | **Events**        | Broadcast lifecycle events for logging/metrics/tests.        | [`Event`], [`EventKind`]               |
//! | **Errors**        | Typed errors with stable labels.                             | [`RelayError`], [`DispatchError`]      |
//! | **Configuration** | Validated limits and intervals.                              | [`Config`]                             |
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use taskrelay::{Config, DispatchError, TaskManager, Tracked};
//!
//! #[derive(Debug, Default)]
//! struct Pong { request_id: String, payload: String }
//!
//! impl Tracked for Pong {
//!     fn request_id(&self) -> &str { &self.request_id }
//!     fn set_request_id(&mut self, id: String) { self.request_id = id; }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = TaskManager::new(Config::default())?;
//!
//!     // The "remote worker" answers through the manager, not through the dispatch.
//!     let remote = Arc::clone(&manager);
//!     let pong: Pong = manager
//!         .external_execute("instance-a", "req-1", move || async move {
//!             tokio::spawn(async move {
//!                 let reply = Pong { payload: "pong".into(), ..Pong::default() };
//!                 let _ = remote.set_task_result("req-1", reply);
//!             });
//!             Ok::<_, DispatchError>(())
//!         }, None)
//!         .await?;
//!
//!     assert_eq!(pong.request_id, "req-1");
//!     assert_eq!(pong.payload, "pong");
//!
//!     manager.dispose().await;
//!     Ok(())
//! }
//! ```

mod channel;
mod config;
mod core;
mod error;
mod events;
mod tracked;

// ---- Public re-exports ----

pub use channel::RelayStream;
pub use config::{Config, MAX_INTERVAL, MAX_QUEUE_WAIT, ORPHAN_TIMEOUT_FACTOR};
pub use core::{
    DISPOSAL_TIMEOUT, HealthReport, MAX_PROCESSING_BATCH, MONITOR_STOP_TIMEOUT, QueueReport,
    RESOURCE_WARNING_RATIO, TaskManager,
};
pub use error::{ConfigError, DispatchError, RelayError};
pub use events::{Event, EventKind};
pub use tracked::Tracked;
