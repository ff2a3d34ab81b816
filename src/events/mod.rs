//! Runtime events: types and broadcast bus.
//!
//! This module groups the event **data model** and the **bus** used to
//! publish/subscribe to events emitted by the task manager.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: task/stream correlators, dispatch watchers, stream monitors,
//!   queue processor, health check, disposal.
//! - **Consumers**: anything holding a receiver from
//!   [`TaskManager::subscribe`](crate::TaskManager::subscribe).

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
