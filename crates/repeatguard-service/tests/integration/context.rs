use std::sync::Arc;

use repeatguard_service::InvocationContext;
use repeatguard_service::backend::InMemoryBackend;

use crate::{arguments, ok, setup_guard};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_see_their_own_token() {
    let guard = setup_guard(Arc::new(InMemoryBackend::default()));

    let tasks = (0..8).map(|i| {
        let guard = guard.clone();
        tokio::spawn(async move {
            let id = format!("order-{i}");
            let seen = guard
                .invoke("checkout", &arguments(&id), |context| async move {
                    tokio::task::yield_now().await;
                    let child = context.spawn(async {
                        tokio::task::yield_now().await;
                        InvocationContext::current_token()
                    });
                    let child = child.await?;
                    let own = InvocationContext::current_token();
                    Ok::<_, anyhow::Error>((
                        own.map(|token| token.to_string()),
                        child.map(|token| token.to_string()),
                    ))
                })
                .await
                .unwrap();
            (id, seen)
        })
    });

    for task in futures::future::join_all(tasks).await {
        let (id, (own, child)) = task.unwrap();
        assert_eq!(own.as_deref(), Some(id.as_str()));
        assert_eq!(child.as_deref(), Some(id.as_str()));
    }
}

#[tokio::test]
async fn test_children_observe_cleared_context() {
    let guard = setup_guard(Arc::new(InMemoryBackend::default()));
    let (sender, receiver) = tokio::sync::oneshot::channel::<()>();

    let mut child = None;
    guard
        .invoke("checkout", &arguments("order-1"), |context| {
            let child = &mut child;
            async move {
                *child = Some(context.spawn(async move {
                    let context = InvocationContext::current().unwrap();
                    let _ = receiver.await;
                    context.get()
                }));
                Ok::<_, anyhow::Error>(ok())
            }
        })
        .await
        .unwrap();
    sender.send(()).unwrap();

    let token = child.unwrap().await.unwrap();
    assert_eq!(token, None);
    assert!(InvocationContext::current().is_none());
}
