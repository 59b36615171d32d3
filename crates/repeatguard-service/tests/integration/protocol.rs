use std::time::Duration;

use tokio::sync::Notify;

use repeatguard_service::lock::{method_lock_key, response_key};
use repeatguard_service::{GuardError, RepeatGuard, RepeatPolicy, Window};

use crate::{BackendCall, RecordingBackend, arguments, ok, setup_guard};

fn call(method: &'static str, key: &str) -> BackendCall {
    BackendCall {
        method,
        key: key.to_owned(),
    }
}

#[tokio::test]
async fn test_first_call_then_replay() {
    let backend = RecordingBackend::new();
    let guard = setup_guard(backend.clone());
    let arguments = arguments("order-1");

    let method_key = method_lock_key("order-1", "checkout");
    let method_token = guard.lock().isolate(&method_key);
    let response_token = guard
        .lock()
        .isolate(&response_key(guard.lock().prefix(), &method_key));

    guard
        .invoke("checkout", &arguments, |_| async { Ok::<_, anyhow::Error>(ok()) })
        .await
        .unwrap();
    assert_eq!(
        backend.calls(),
        [
            call("set_nx", &method_token),
            call("get", &response_token),
            call("set_nx", &response_token),
            call("del", &method_token),
        ]
    );

    // `checkout` has a fixed window, so the replay leaves the response TTL alone
    backend.clear();
    guard
        .invoke("checkout", &arguments, |_| async { Ok::<_, anyhow::Error>(ok()) })
        .await
        .unwrap();
    assert_eq!(
        backend.calls(),
        [
            call("set_nx", &method_token),
            call("get", &response_token),
            call("del", &method_token),
        ]
    );
}

#[tokio::test]
async fn test_sliding_replay_rearms_response() {
    let backend = RecordingBackend::new();
    let guard = setup_guard(backend.clone());
    let policy = RepeatPolicy::new(Window::Sliding)
        .use_last_response(true)
        .token_key("/id");
    let operation = guard.guarded("checkout", policy);
    let arguments = arguments("order-1");

    for _ in 0..2 {
        operation
            .call(&arguments, |_| async { Ok::<_, anyhow::Error>(ok()) })
            .await
            .unwrap();
    }

    let method_key = method_lock_key("order-1", "checkout");
    let response_token = guard
        .lock()
        .isolate(&response_key(guard.lock().prefix(), &method_key));
    assert_eq!(
        backend.methods(),
        ["set_nx", "get", "set_nx", "del", "set_nx", "get", "expire", "del"]
    );
    assert_eq!(backend.calls()[6], call("expire", &response_token));
}

/// Runs a second call while the first one is still in flight, and returns the backend methods
/// called along the way.
async fn overlapping_calls(window: Window) -> Vec<&'static str> {
    let backend = RecordingBackend::new();
    let guard = setup_guard(backend.clone());
    let policy = RepeatPolicy::new(window)
        .method_lock_ttl(Duration::from_secs(10))
        .use_last_response(true)
        .token_key("/id");
    let operation = guard.guarded("checkout", policy);
    let arguments = arguments("order-1");
    let finish = Notify::new();

    let first = operation.call(&arguments, |_| async {
        finish.notified().await;
        Ok::<_, anyhow::Error>(ok())
    });
    let second = async {
        let result = operation
            .call(&arguments, |_| async { Ok::<_, anyhow::Error>(ok()) })
            .await;
        finish.notify_one();
        result
    };
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.unwrap(), ok());
    // there is nothing to replay while the first call is still running
    assert!(matches!(second, Err(GuardError::Duplicate(_))));

    backend.methods()
}

#[tokio::test]
async fn test_sliding_window_refreshes_contended_lock() {
    let methods = overlapping_calls(Window::Sliding).await;
    assert_eq!(
        methods,
        ["set_nx", "get", "set_nx", "expire", "get", "set_nx", "del"]
    );
}

#[tokio::test]
async fn test_fixed_window_leaves_contended_lock() {
    let methods = overlapping_calls(Window::Fixed).await;
    assert_eq!(methods, ["set_nx", "get", "set_nx", "get", "set_nx", "del"]);
}

#[tokio::test]
async fn test_prefix_namespaces_tokens() {
    let backend = RecordingBackend::new();
    let guard = RepeatGuard::builder(backend.clone())
        .prefix("tenant-a:")
        .build();
    let operation = guard.guarded("checkout", RepeatPolicy::default().token_key("/id"));

    operation
        .call(&arguments("order-1"), |_| async { Ok::<_, anyhow::Error>(1u8) })
        .await
        .unwrap();

    let calls = backend.calls();
    assert!(!calls.is_empty());
    assert!(calls.iter().all(|call| call.key.starts_with("tenant-a:")));
}
