//! # Example: relay
//!
//! Demonstrates both correlation styles against a simulated remote worker.
//!
//! Shows how to:
//! - Await a result delivered out-of-band with [`TaskManager::external_execute`]
//! - Receive a relayed stream with [`TaskManager::channel_stream_response`]
//! - Watch runtime events through [`TaskManager::subscribe`]
//!
//! ## Flow
//! ```text
//! main()
//!   ├─► TaskManager::new(cfg)
//!   ├─► spawn event printer (subscribe)
//!   │
//!   ├─► external_execute("worker-1", "req-1", dispatch)
//!   │     └─► dispatch "sends" the request; the worker answers 200ms later
//!   │           through set_task_result("req-1", Answer)
//!   │
//!   ├─► channel_stream_response("worker-1", "conn-1", "req-2", invoker)
//!   │     └─► reader returned; the worker relays three lines
//!   │           through set_channel_stream_result("req-2", source)
//!   │
//!   └─► dispose()
//! ```
//!
//! ## Run
//! ```bash
//! RUST_LOG=taskrelay=debug cargo run --example relay
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use taskrelay::{Config, DispatchError, TaskManager, Tracked};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct Answer {
    request_id: String,
    text: String,
}

impl Tracked for Answer {
    fn request_id(&self) -> &str {
        &self.request_id
    }

    fn set_request_id(&mut self, id: String) {
        self.request_id = id;
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("=== relay example ===\n");

    // 2. Configure the manager
    let cfg = Config {
        default_timeout: Duration::from_secs(5),
        ..Config::default()
    };
    let manager = TaskManager::new(cfg)?;

    // 3. Print events
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(ev) = events.recv().await {
            println!(
                "[event] {:?} request={:?} elapsed_ms={:?}",
                ev.kind, ev.request_id, ev.elapsed_ms
            );
        }
    });

    // 4. Task: the worker answers out-of-band
    let remote = Arc::clone(&manager);
    let answer: Answer = manager
        .external_execute(
            "worker-1",
            "req-1",
            move || async move {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    let reply = Answer {
                        text: "42".into(),
                        ..Answer::default()
                    };
                    if let Err(e) = remote.set_task_result("req-1", reply) {
                        eprintln!("[worker] failed to deliver: {e}");
                    }
                });
                Ok::<_, DispatchError>(())
            },
            None,
        )
        .await?;
    println!("[main] answer for {}: {}", answer.request_id, answer.text);

    // 5. Stream: the worker relays three lines
    let mut reader = manager
        .channel_stream_response::<String, _, _>(
            "worker-1",
            "conn-1",
            "req-2",
            || async { Ok::<_, DispatchError>(()) },
            None,
        )
        .await?;

    let remote = Arc::clone(&manager);
    tokio::spawn(async move {
        let lines = ["alpha", "beta", "gamma"].map(|s| Ok::<_, String>(s.to_string()));
        let source = futures::stream::iter(lines).then(|item| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            item
        });
        if let Err(e) = remote.set_channel_stream_result("req-2", source).await {
            eprintln!("[worker] stream failed: {e}");
        }
    });

    while let Some(item) = reader.next().await {
        match item {
            Ok(line) => println!("[main] line: {line}"),
            Err(e) => println!("[main] stream error: {e}"),
        }
    }

    // 6. Shut down
    manager.dispose().await;
    println!("\n=== done ===");
    Ok(())
}
