//! Runtime core: correlation, admission and lifecycle.
//!
//! The only public type from this module is [`TaskManager`], plus the reports
//! returned by its maintenance passes.
//!
//! Internal modules:
//! - [`manager`]: the owned state, background passes and disposal;
//! - [`tasks`]: task registry and result correlation;
//! - [`streams`]: stream registry, buffer bridging and timeout monitors;
//! - [`queue`]: admission queues and their processing pass;
//! - [`health`]: orphan reaper and resource pressure reporting;
//! - [`slot`]: single-assignment completion slot.

mod health;
mod manager;
mod queue;
mod slot;
mod streams;
mod tasks;

pub use health::{HealthReport, RESOURCE_WARNING_RATIO};
pub use manager::{DISPOSAL_TIMEOUT, TaskManager};
pub use queue::{MAX_PROCESSING_BATCH, QueueReport};
pub use streams::MONITOR_STOP_TIMEOUT;
