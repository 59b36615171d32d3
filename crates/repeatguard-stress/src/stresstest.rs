use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use repeatguard_service::RepeatGuard;
use repeatguard_service::config::Config;

use crate::telemetry::{Telemetry, UNTAGGED};
use crate::workloads::{Outcome, PreparedWorkload, WorkloadsConfig};

/// The result of running a single workload.
struct WorkloadReport {
    operation: String,
    concurrency: usize,
    keys: usize,
    durations: DDSketch,
    executed: usize,
    replayed: usize,
    rejected: usize,
    failed: usize,
    overlaps: usize,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
    telemetry: &Telemetry,
) -> Result<()> {
    let guard = RepeatGuard::from_config(&config)
        .await
        .context("failed to start the guard")?;

    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| {
            let operation = format!("workload-{i}");
            (operation.clone(), Arc::new(PreparedWorkload::new(&guard, operation, workload)))
        })
        .collect();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (operation, workload) in workloads {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let task_start = Instant::now();
                        let key = rand::random_range(0..workload.keys());

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            let outcome = workload.call(key).await;
                            if outcome == Outcome::Failed {
                                transaction.set_status(sentry::protocol::SpanStatus::InternalError);
                            }
                            transaction.finish();

                            task_durations
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let durations = std::mem::take(
                &mut *task_durations
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );
            let counters = &workload.counters;
            WorkloadReport {
                operation,
                concurrency,
                keys: workload.keys(),
                durations,
                executed: counters.get(Outcome::Executed),
                replayed: counters.get(Outcome::Replayed),
                rejected: counters.get(Outcome::Rejected),
                failed: counters.get(Outcome::Failed),
                overlaps: counters.overlaps(),
            }
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    let mut violations = 0;
    for (i, task) in finished_tasks.into_iter().enumerate() {
        let report = task.context("workload task panicked")?;
        violations += report.overlaps;
        print_report(i, &report, duration, telemetry);
    }

    if telemetry.total_metric_packets() > 0 {
        let untagged = telemetry.metric_packets(UNTAGGED);
        println!("Metrics without operation: {untagged} packets");
    }
    if telemetry.sentry_requests() > 0 {
        println!("Sentry: {} requests", telemetry.sentry_requests());
    }
    if telemetry.log_bytes() > 0 {
        println!("Logs: {} bytes", telemetry.log_bytes());
    }

    if violations > 0 {
        anyhow::bail!("{violations} executions overlapped with another execution of the same key");
    }

    Ok(())
}

fn print_report(i: usize, report: &WorkloadReport, duration: Duration, telemetry: &Telemetry) {
    let WorkloadReport {
        operation,
        concurrency,
        keys,
        durations,
        executed,
        replayed,
        rejected,
        failed,
        overlaps,
    } = report;

    let ops = durations.count();
    let ops_ps = ops as f32 / duration.as_secs_f32();
    println!(
        "Workload {i} (concurrency: {concurrency}, keys: {keys}): {ops} operations, {ops_ps:.2} ops/s"
    );
    println!(
        "  executed: {executed}; replayed: {replayed}; rejected: {rejected}; failed: {failed}"
    );

    if ops > 0 {
        let quantile = |q| {
            let secs = durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    let packets = telemetry.metric_packets(operation);
    if packets > 0 {
        let per_op = packets as f32 / ops.max(1) as f32;
        println!("  metrics: {packets} packets, {per_op:.1} per operation");
    }

    if *overlaps > 0 {
        println!("  VIOLATION: {overlaps} overlapping executions");
    }
}
