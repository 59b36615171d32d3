use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use repeatguard_service::backend::InMemoryBackend;
use repeatguard_service::{DuplicateKind, GuardError, RepeatGuard, RepeatPolicy, Window};

use crate::{FailingBackend, Status, arguments, ok, setup_configured_guard, setup_guard};

#[tokio::test]
async fn test_fixed_window_replay_then_expiry() {
    let backend = Arc::new(InMemoryBackend::default());
    let guard = setup_guard(backend);
    let policy = RepeatPolicy::new(Window::Fixed)
        .method_lock_ttl(Duration::from_millis(200))
        .response_ttl(Duration::from_millis(500))
        .use_last_response(true)
        .token_key("/id");
    let operation = guard.guarded("checkout", policy);
    let executions = AtomicUsize::new(0);
    let arguments = arguments("order-1");

    let call = || {
        operation.call(&arguments, |_| async {
            executions.fetch_add(1, Ordering::Relaxed);
            Ok::<_, anyhow::Error>(ok())
        })
    };

    // A executes
    assert_eq!(call().await.unwrap(), ok());
    assert_eq!(executions.load(Ordering::Relaxed), 1);

    // B is answered from the cached response
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(call().await.unwrap(), ok());
    assert_eq!(executions.load(Ordering::Relaxed), 1);

    // C comes in after the response expired and executes fresh
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(call().await.unwrap(), ok());
    assert_eq!(executions.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn test_fixed_window_response_expires_despite_duplicates() {
    let guard = setup_guard(Arc::new(InMemoryBackend::default()));
    let policy = RepeatPolicy::new(Window::Fixed)
        .method_lock_ttl(Duration::from_millis(200))
        .response_ttl(Duration::from_millis(600))
        .use_last_response(true)
        .token_key("/id");
    let operation = guard.guarded("checkout", policy);
    let executions = AtomicUsize::new(0);
    let arguments = arguments("order-1");

    let call = || {
        operation.call(&arguments, |_| async {
            executions.fetch_add(1, Ordering::Relaxed);
            Ok::<_, anyhow::Error>(ok())
        })
    };

    assert_eq!(call().await.unwrap(), ok());

    // duplicates at 150ms, 300ms and 450ms are replayed without extending the response
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(call().await.unwrap(), ok());
    }
    assert_eq!(executions.load(Ordering::Relaxed), 1);

    // at 800ms the response expired on schedule
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(call().await.unwrap(), ok());
    assert_eq!(executions.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn test_sliding_window_response_lives_while_retried() {
    let guard = setup_guard(Arc::new(InMemoryBackend::default()));
    let policy = RepeatPolicy::new(Window::Sliding)
        .method_lock_ttl(Duration::from_millis(200))
        .response_ttl(Duration::from_millis(400))
        .use_last_response(true)
        .token_key("/id");
    let operation = guard.guarded("checkout", policy);
    let executions = AtomicUsize::new(0);
    let arguments = arguments("order-1");

    let call = || {
        operation.call(&arguments, |_| async {
            executions.fetch_add(1, Ordering::Relaxed);
            Ok::<_, anyhow::Error>(ok())
        })
    };

    // every duplicate re-arms the response, so it outlives its original TTL
    for _ in 0..4 {
        assert_eq!(call().await.unwrap(), ok());
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    assert_eq!(executions.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_failing_winner_leaves_nothing_behind() {
    let guard = setup_guard(Arc::new(InMemoryBackend::default()));
    let arguments = arguments("order-1");

    let result = guard
        .invoke("checkout", &arguments, |_| async {
            Err::<Status, _>(anyhow!("card declined"))
        })
        .await;
    assert!(matches!(result, Err(GuardError::Internal(_))));

    let result = guard
        .invoke("checkout", &arguments, |_| async {
            Ok::<_, anyhow::Error>(ok())
        })
        .await;
    assert_eq!(result.unwrap(), ok());
}

#[tokio::test]
async fn test_rejected_duplicate() {
    let guard = setup_guard(Arc::new(InMemoryBackend::default()));
    let arguments = arguments("order-1");

    guard
        .invoke("refund", &arguments, |_| async { Ok::<_, anyhow::Error>(()) })
        .await
        .unwrap();
    let error = guard
        .invoke("refund", &arguments, |_| async { Ok::<_, anyhow::Error>(()) })
        .await
        .unwrap_err();

    insta::assert_snapshot!(error, @"conflict: refund already in progress");
    let GuardError::Duplicate(duplicate) = error else {
        panic!("expected a duplicate error");
    };
    assert_eq!(duplicate.kind, DuplicateKind::Conflict);
}

#[tokio::test]
async fn test_backend_read_failure() {
    let guard = setup_guard(FailingBackend::failing_on(&["get"]));
    let executions = AtomicUsize::new(0);

    let result = guard
        .invoke("checkout", &arguments("order-1"), |_| async {
            executions.fetch_add(1, Ordering::Relaxed);
            Ok::<_, anyhow::Error>(ok())
        })
        .await;

    assert!(matches!(result, Err(GuardError::Internal(_))));
    assert_eq!(executions.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_backend_write_failure() {
    let guard = setup_guard(FailingBackend::failing_on(&["set_nx"]));

    let result = guard
        .invoke("checkout", &arguments("order-1"), |_| async {
            Ok::<_, anyhow::Error>(ok())
        })
        .await;

    let error = result.unwrap_err();
    insta::assert_snapshot!(error, @"guarded call failed: set_nx is unavailable");
}

#[tokio::test]
async fn test_release_failure_does_not_override_result() {
    let guard = setup_guard(FailingBackend::failing_on(&["del"]));

    let result = guard
        .invoke("checkout", &arguments("order-1"), |_| async {
            Ok::<_, anyhow::Error>(ok())
        })
        .await;

    assert_eq!(result.unwrap(), ok());
}

#[tokio::test]
async fn test_configured_operations() {
    let guard = setup_configured_guard(
        r#"
        prefix: "shop:"
        backend:
          type: memory
          max_capacity: 1000
        operations:
          checkout:
            window: fixed
            use_last_response: true
            token_keys: ["/cart/id", "/customer"]
        "#,
    )
    .await;
    let arguments = serde_json::json!({"cart": {"id": "c-9"}, "customer": 12});

    assert_eq!(guard.lock().prefix(), "shop:");
    assert!(guard.policy("checkout").is_some());

    let first: u32 = guard
        .invoke("checkout", &arguments, |context| async move {
            assert_eq!(context.get().as_deref(), Some("c-9:12"));
            Ok::<_, anyhow::Error>(1)
        })
        .await
        .unwrap();
    let second: u32 = guard
        .invoke("checkout", &arguments, |_| async { Ok::<_, anyhow::Error>(2) })
        .await
        .unwrap();
    assert_eq!((first, second), (1, 1));

    let missing = guard
        .invoke("refund", &arguments, |_| async { Ok::<_, anyhow::Error>(3u32) })
        .await;
    assert!(matches!(missing, Err(GuardError::Config(_))));
}

#[tokio::test]
async fn test_guards_share_backend() {
    let backend = Arc::new(InMemoryBackend::default());
    let first = setup_guard(backend.clone());
    let second = RepeatGuard::builder(backend)
        .policy(
            "refund",
            repeatguard_test::reject_policy(DuplicateKind::Rejected, "already refunded"),
        )
        .build();
    let arguments = arguments("order-1");

    first
        .invoke("refund", &arguments, |_| async { Ok::<_, anyhow::Error>(()) })
        .await
        .unwrap();
    let result = second
        .invoke("refund", &arguments, |_| async { Ok::<_, anyhow::Error>(()) })
        .await;

    assert!(result.unwrap_err().is_duplicate());
}
