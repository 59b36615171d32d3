use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use repeatguard_service::backend::InMemoryBackend;
use repeatguard_service::{GuardError, RepeatGuard};

use crate::{Status, arguments, ok, setup_guard};

async fn race(guard: RepeatGuard, ids: Vec<String>) -> (usize, Vec<Result<Status, GuardError>>) {
    let executions = Arc::new(AtomicUsize::new(0));

    let tasks = ids.into_iter().map(|id| {
        let guard = guard.clone();
        let executions = Arc::clone(&executions);
        tokio::spawn(async move {
            guard
                .invoke("checkout", &arguments(&id), |_| async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, anyhow::Error>(ok())
                })
                .await
        })
    });
    let results = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|result| result.unwrap())
        .collect();

    (executions.load(Ordering::SeqCst), results)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_execute_once() {
    let guard = setup_guard(Arc::new(InMemoryBackend::default()));
    let ids = vec!["order-1".to_owned(); 16];

    let (executions, results) = race(guard, ids).await;

    assert_eq!(executions, 1);
    let succeeded = results.iter().filter(|result| result.is_ok()).count();
    assert!(succeeded >= 1);
    for result in results {
        match result {
            Ok(status) => assert_eq!(status, ok()),
            Err(error) => assert!(error.is_duplicate(), "{error}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_execute_independently() {
    let guard = setup_guard(Arc::new(InMemoryBackend::default()));
    let ids = (0..8).map(|i| format!("order-{i}")).collect();

    let (executions, results) = race(guard, ids).await;

    assert_eq!(executions, 8);
    assert!(results.iter().all(|result| result.is_ok()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_duplicates_replay() {
    let guard = setup_guard(Arc::new(InMemoryBackend::default()));

    let (executions, _) = race(guard.clone(), vec!["order-1".to_owned()]).await;
    assert_eq!(executions, 1);

    let (executions, results) = race(guard, vec!["order-1".to_owned(); 8]).await;
    assert_eq!(executions, 0);
    assert!(results.iter().all(|result| result.as_ref().is_ok_and(|s| *s == ok())));
}
