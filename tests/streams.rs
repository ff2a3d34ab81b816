mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::{manual_config, next_event, sent, wait_until};
use futures::StreamExt;
use taskrelay::{Config, DispatchError, EventKind, RelayError, TaskManager};

#[tokio::test(start_paused = true)]
async fn relayed_items_arrive_in_order_then_end() {
    let manager = TaskManager::new(manual_config()).unwrap();
    let reader = manager
        .channel_stream_response::<String, _, _>("inst", "conn-1", "lines", sent, None)
        .await
        .unwrap();

    let source = futures::stream::iter(
        ["one", "two", "three"].map(|s| Ok::<_, String>(s.to_string())),
    );
    manager
        .set_channel_stream_result("lines", source)
        .await
        .unwrap();

    let items: Vec<String> = reader.map(|item| item.unwrap()).collect().await;
    assert_eq!(items, vec!["one", "two", "three"]);
    assert_eq!(manager.pending_streams(), 0);
    assert_eq!(manager.active_monitors(), 0);
}

#[tokio::test(start_paused = true)]
async fn duplicate_stream_request_is_already_pending() {
    let manager = TaskManager::new(manual_config()).unwrap();
    let _reader = manager
        .channel_stream_response::<u32, _, _>("inst", "conn", "same", sent, None)
        .await
        .unwrap();

    let err = manager
        .channel_stream_response::<u32, _, _>("inst", "conn", "same", sent, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::AlreadyPending { .. }));
    assert!(err.to_string().contains("already pending"));
    assert_eq!(manager.pending_streams(), 1);
}

#[tokio::test(start_paused = true)]
async fn invoker_failure_tears_down_and_propagates() {
    let manager = TaskManager::new(manual_config()).unwrap();
    let err = manager
        .channel_stream_response::<u32, _, _>(
            "inst",
            "conn",
            "broken",
            || async { Err::<(), _>(DispatchError::fail("socket closed")) },
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RelayError::Dispatch { ref error, .. } if error == "socket closed"));
    assert_eq!(manager.pending_streams(), 0);
    assert_eq!(manager.active_monitors(), 0);

    // the id is free again
    manager
        .channel_stream_response::<u32, _, _>("inst", "conn", "broken", sent, None)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn source_failure_reaches_reader_and_caller() {
    let manager = TaskManager::new(manual_config()).unwrap();
    let mut reader = manager
        .channel_stream_response::<u32, _, _>("inst", "conn", "flaky", sent, None)
        .await
        .unwrap();

    let source = futures::stream::iter(vec![Ok(1u32), Err("peer reset"), Ok(3)]);
    let err = manager
        .set_channel_stream_result("flaky", source)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Stream { ref error, .. } if error == "peer reset"));

    assert_eq!(reader.recv().await, Some(Ok(1)));
    assert_eq!(reader.recv().await, Some(Err(err)));
    assert_eq!(reader.recv().await, None);
}

#[tokio::test(start_paused = true)]
async fn unfed_stream_ends_with_timeout() {
    let cfg = Config {
        default_timeout: Duration::from_secs(2),
        ..manual_config()
    };
    let manager = TaskManager::new(cfg).unwrap();
    let mut events = manager.subscribe();
    let mut reader = manager
        .channel_stream_response::<u32, _, _>("inst", "conn", "silent", sent, None)
        .await
        .unwrap();

    let item = reader.recv().await.unwrap();
    match item {
        Err(err @ RelayError::Timeout { .. }) => assert!(err.to_string().contains("timed out")),
        other => panic!("expected timeout item, got {other:?}"),
    }
    assert_eq!(reader.recv().await, None);

    next_event(&mut events, EventKind::StreamTimedOut, "silent").await;
    assert_eq!(manager.pending_streams(), 0);
}

#[tokio::test(start_paused = true)]
async fn unknown_stream_result_is_reported_not_failed() {
    let manager = TaskManager::new(manual_config()).unwrap();
    let mut events = manager.subscribe();

    let source = futures::stream::iter(vec![Ok::<_, String>(1u32)]);
    manager
        .set_channel_stream_result("ghost", source)
        .await
        .unwrap();

    let ev = next_event(&mut events, EventKind::UnknownRequest, "ghost").await;
    assert_eq!(ev.reason.as_deref(), Some("set_channel_stream_result"));
}

#[tokio::test(start_paused = true)]
async fn dropped_reader_stops_relay() {
    let manager = TaskManager::new(manual_config()).unwrap();
    let reader = manager
        .channel_stream_response::<u32, _, _>("inst", "conn", "gone", sent, None)
        .await
        .unwrap();
    drop(reader);

    let source = futures::stream::iter((0..100u32).map(Ok::<_, String>));
    manager
        .set_channel_stream_result("gone", source)
        .await
        .unwrap();
    assert_eq!(manager.pending_streams(), 0);
}

#[tokio::test(start_paused = true)]
async fn invoker_outlives_early_stream_completion() {
    let manager = TaskManager::new(manual_config()).unwrap();
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let (s, f) = (Arc::clone(&started), Arc::clone(&finished));
    let (reader, ()) = tokio::join!(
        manager.channel_stream_response::<u32, _, _>(
            "inst",
            "conn",
            "early",
            move || async move {
                s.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                f.store(true, Ordering::SeqCst);
                Ok::<_, DispatchError>(())
            },
            None,
        ),
        async {
            wait_until(|| started.load(Ordering::SeqCst)).await;
            let source = futures::stream::iter(vec![Ok::<_, String>(7u32)]);
            manager
                .set_channel_stream_result("early", source)
                .await
                .unwrap();
        }
    );

    let items: Vec<_> = reader.unwrap().collect().await;
    assert_eq!(items, vec![Ok(7)]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(finished.load(Ordering::SeqCst));
}
