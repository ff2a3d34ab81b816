mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::{Other, Reply, manual_config, next_event, sent, wait_until};
use taskrelay::{Config, DispatchError, EventKind, RelayError, TaskManager};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn concurrent_duplicate_registration_fails_once() {
    let manager = TaskManager::new(manual_config()).unwrap();

    let (first, second, ()) = tokio::join!(
        manager.external_execute::<Reply, _, _>("inst", "dup", sent, None),
        manager.external_execute::<Reply, _, _>("inst", "dup", sent, None),
        async {
            wait_until(|| manager.pending_tasks() == 1).await;
            manager.set_task_result("dup", Reply::new("ok")).unwrap();
        }
    );

    let outcomes = [first, second];
    let ok = outcomes.iter().filter(|r| r.is_ok()).count();
    let dup = outcomes
        .iter()
        .filter(|r| matches!(r, Err(RelayError::AlreadyPending { .. })))
        .count();
    assert_eq!((ok, dup), (1, 1));
}

#[tokio::test(start_paused = true)]
async fn result_is_delivered_once_and_second_call_is_noop() {
    let manager = TaskManager::new(manual_config()).unwrap();
    let mut events = manager.subscribe();

    let m = Arc::clone(&manager);
    let waiter = tokio::spawn(async move {
        m.external_execute::<Reply, _, _>("inst", "once", sent, None)
            .await
    });

    wait_until(|| manager.pending_tasks() == 1).await;
    manager.set_task_result("once", Reply::new("first")).unwrap();
    let reply = waiter.await.unwrap().unwrap();
    assert_eq!(reply.body, "first");

    // entry is gone now: the late result is only reported
    manager.set_task_result("once", Reply::new("late")).unwrap();
    let ev = next_event(&mut events, EventKind::UnknownRequest, "once").await;
    assert_eq!(ev.reason.as_deref(), Some("set_task_result"));
}

#[tokio::test(start_paused = true)]
async fn missing_result_times_out_after_default_timeout() {
    let cfg = Config {
        default_timeout: Duration::from_secs(2),
        ..manual_config()
    };
    let manager = TaskManager::new(cfg).unwrap();

    let started = Instant::now();
    let err = manager
        .external_execute::<Reply, _, _>("inst", "slow-req", sent, None)
        .await
        .unwrap_err();

    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(matches!(err, RelayError::Timeout { ref request_id, .. } if request_id == "slow-req"));
    assert!(err.to_string().contains("timed out"));
    assert!(err.to_string().contains("slow-req"));
    assert_eq!(manager.pending_tasks(), 0);
}

#[tokio::test(start_paused = true)]
async fn caller_token_cannot_extend_default_timeout() {
    let cfg = Config {
        default_timeout: Duration::from_secs(2),
        ..manual_config()
    };
    let manager = TaskManager::new(cfg).unwrap();
    let token = CancellationToken::new();

    let started = Instant::now();
    let err = manager
        .external_execute::<Reply, _, _>("inst", "r", sent, Some(token))
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn result_carries_caller_request_id() {
    let manager = TaskManager::new(manual_config()).unwrap();
    let flag = Arc::new(AtomicBool::new(false));

    let dispatched = Arc::clone(&flag);
    let (res, ()) = tokio::join!(
        manager.external_execute::<Reply, _, _>(
            "inst",
            "req-42",
            move || async move {
                dispatched.store(true, Ordering::SeqCst);
                Ok::<_, DispatchError>(())
            },
            None,
        ),
        async {
            wait_until(|| flag.load(Ordering::SeqCst)).await;
            let dummy = Reply {
                request_id: "something-else".into(),
                body: "dummy".into(),
            };
            manager.set_task_result("req-42", dummy).unwrap();
        }
    );

    let reply = res.unwrap();
    assert!(flag.load(Ordering::SeqCst));
    assert_eq!(reply.request_id, "req-42");
    assert_eq!(reply.body, "dummy");
}

#[tokio::test(start_paused = true)]
async fn execute_feeds_returned_value_as_result() {
    let manager = TaskManager::new(manual_config()).unwrap();
    let reply = manager
        .execute::<Reply, _, _>(
            "inst",
            "exec-1",
            || async { Ok::<_, DispatchError>(Reply::new("returned")) },
            None,
        )
        .await
        .unwrap();

    assert_eq!(reply.request_id, "exec-1");
    assert_eq!(reply.body, "returned");
    assert_eq!(manager.pending_tasks(), 0);
}

#[tokio::test(start_paused = true)]
async fn dispatch_failure_and_cancellation_surface_immediately() {
    let manager = TaskManager::new(manual_config()).unwrap();

    let err = manager
        .external_execute::<Reply, _, _>(
            "inst",
            "fail",
            || async { Err::<(), _>(DispatchError::fail("connection refused")) },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Dispatch { ref error, .. } if error == "connection refused"));

    let err = manager
        .external_execute::<Reply, _, _>(
            "inst",
            "cancelled",
            || async { Err::<(), _>(DispatchError::Canceled) },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Canceled { .. }));
    assert_eq!(manager.pending_tasks(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_task_resolves_known_and_reports_unknown() {
    let manager = TaskManager::new(manual_config()).unwrap();
    let mut events = manager.subscribe();

    manager.cancel_task("nobody");
    let ev = next_event(&mut events, EventKind::UnknownRequest, "nobody").await;
    assert_eq!(ev.reason.as_deref(), Some("cancel_task"));

    let m = Arc::clone(&manager);
    let waiter = tokio::spawn(async move {
        m.external_execute::<Reply, _, _>("inst", "victim", sent, None)
            .await
    });
    wait_until(|| manager.pending_tasks() == 1).await;

    manager.cancel_task("victim");
    let err = waiter.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        RelayError::Canceled {
            request_id: "victim".into()
        }
    );
    next_event(&mut events, EventKind::TaskCanceled, "victim").await;
}

#[tokio::test(start_paused = true)]
async fn request_instance_id_only_sees_registered_tasks() {
    let manager = TaskManager::new(manual_config()).unwrap();
    assert!(matches!(
        manager.request_instance_id("missing"),
        Err(RelayError::NotFound { .. })
    ));

    let m = Arc::clone(&manager);
    let waiter = tokio::spawn(async move {
        m.external_execute::<Reply, _, _>("instance-7", "lookup", sent, None)
            .await
    });
    wait_until(|| manager.pending_tasks() == 1).await;
    assert_eq!(manager.request_instance_id("lookup").unwrap(), "instance-7");

    manager.set_task_result("lookup", Reply::new("x")).unwrap();
    waiter.await.unwrap().unwrap();
    assert!(manager.request_instance_id("lookup").is_err());
}

#[tokio::test(start_paused = true)]
async fn wrong_result_type_is_reported() {
    let manager = TaskManager::new(manual_config()).unwrap();

    let (res, ()) = tokio::join!(
        manager.external_execute::<Reply, _, _>("inst", "typed", sent, None),
        async {
            wait_until(|| manager.pending_tasks() == 1).await;
            manager.set_task_result("typed", Other::default()).unwrap();
        }
    );

    match res {
        Err(RelayError::TypeMismatch {
            expected, actual, ..
        }) => {
            assert!(expected.ends_with("Reply"));
            assert!(actual.ends_with("Other"));
        }
        other => panic!("expected type mismatch, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn blank_ids_are_rejected() {
    let manager = TaskManager::new(manual_config()).unwrap();
    let err = manager
        .external_execute::<Reply, _, _>("", "r", sent, None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RelayError::InvalidArgument {
            field: "instance_id"
        }
    );

    let err = manager
        .external_execute::<Reply, _, _>("inst", "   ", sent, None)
        .await
        .unwrap_err();
    assert_eq!(err.as_label(), "relay_invalid_argument");
    assert_eq!(manager.pending_tasks(), 0);
}
