#![allow(dead_code)]

use std::time::Duration;

use taskrelay::{Config, DispatchError, Event, EventKind, Tracked};
use tokio::sync::broadcast;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Reply {
    pub request_id: String,
    pub body: String,
}

impl Reply {
    pub fn new(body: &str) -> Self {
        Self {
            request_id: String::new(),
            body: body.to_string(),
        }
    }
}

impl Tracked for Reply {
    fn request_id(&self) -> &str {
        &self.request_id
    }

    fn set_request_id(&mut self, id: String) {
        self.request_id = id;
    }
}

#[derive(Debug, Default)]
pub struct Other {
    pub request_id: String,
}

impl Tracked for Other {
    fn request_id(&self) -> &str {
        &self.request_id
    }

    fn set_request_id(&mut self, id: String) {
        self.request_id = id;
    }
}

/// Config whose background passes never fire during a test; passes are driven by hand.
pub fn manual_config() -> Config {
    Config {
        health_check_interval: Duration::from_secs(3600),
        queue_poll_interval: Duration::from_secs(3600),
        ..Config::default()
    }
}

pub async fn sent() -> Result<(), DispatchError> {
    Ok(())
}

/// Yields until `cond` holds. Does not advance paused time.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    while !cond() {
        tokio::task::yield_now().await;
    }
}

/// Receives events until one of `kind` for `request_id` arrives.
pub async fn next_event(
    rx: &mut broadcast::Receiver<Event>,
    kind: EventKind,
    request_id: &str,
) -> Event {
    loop {
        let ev = rx.recv().await.expect("event bus closed");
        if ev.kind == kind && ev.is_for(request_id) {
            return ev;
        }
    }
}
