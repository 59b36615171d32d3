use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use repeatguard_service::{GuardError, GuardedOperation, RepeatGuard, RepeatPolicy};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// Number of distinct uniqueness keys the calls are spread over.
    pub keys: usize,
    /// How long a single execution of the guarded operation takes.
    #[serde(with = "humantime_serde")]
    pub operation_time: Duration,
    #[serde(default)]
    pub policy: RepeatPolicy,
}

/// How a single guarded call ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Executed,
    Replayed,
    Rejected,
    Failed,
}

/// Counters shared by all calls of one workload.
#[derive(Debug, Default)]
pub struct Counters {
    pub executed: AtomicUsize,
    pub replayed: AtomicUsize,
    pub rejected: AtomicUsize,
    pub failed: AtomicUsize,
    /// Executions that started while another execution of the same key was still running.
    pub overlaps: AtomicUsize,
}

impl Counters {
    pub fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Executed => &self.executed,
            Outcome::Replayed => &self.replayed,
            Outcome::Rejected => &self.rejected,
            Outcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, outcome: Outcome) -> usize {
        match outcome {
            Outcome::Executed => &self.executed,
            Outcome::Replayed => &self.replayed,
            Outcome::Rejected => &self.rejected,
            Outcome::Failed => &self.failed,
        }
        .load(Ordering::Relaxed)
    }

    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::Relaxed)
    }
}

/// A workload bound to its guarded operation.
pub struct PreparedWorkload {
    pub concurrency: usize,
    operation: GuardedOperation,
    operation_time: Duration,
    in_flight: Box<[AtomicUsize]>,
    pub counters: Counters,
}

impl PreparedWorkload {
    /// Registers the workload as operation `name` on `guard`.
    ///
    /// Calls carry their key in the `key` argument, which is used as the uniqueness key unless the
    /// policy names its own token keys.
    pub fn new(guard: &RepeatGuard, name: String, workload: Workload) -> Self {
        let mut policy = workload.policy;
        if policy.token_keys.is_empty() {
            policy = policy.token_key("/key");
        }
        let operation = guard.guarded(name, policy);

        let keys = workload.keys.max(1);
        Self {
            concurrency: workload.concurrency,
            operation,
            operation_time: workload.operation_time,
            in_flight: (0..keys).map(|_| AtomicUsize::new(0)).collect(),
            counters: Counters::default(),
        }
    }

    pub fn keys(&self) -> usize {
        self.in_flight.len()
    }

    /// Makes one guarded call for `key` and records its outcome.
    pub async fn call(&self, key: usize) -> Outcome {
        let arguments = json!({ "key": format!("key-{key}") });
        let ran = AtomicBool::new(false);
        let result = self
            .operation
            .call(&arguments, |_| {
                ran.store(true, Ordering::Relaxed);
                self.execute(key)
            })
            .await;

        let outcome = classify(result, key, ran.load(Ordering::Relaxed));
        self.counters.record(outcome);
        outcome
    }

    async fn execute(&self, key: usize) -> anyhow::Result<Value> {
        let in_flight = &self.in_flight[key % self.in_flight.len()];
        if in_flight.fetch_add(1, Ordering::AcqRel) > 0 {
            self.counters.overlaps.fetch_add(1, Ordering::Relaxed);
        }

        tokio::time::sleep(self.operation_time).await;
        in_flight.fetch_sub(1, Ordering::AcqRel);

        Ok(json!({ "key": key }))
    }
}

fn classify(result: Result<Value, GuardError>, key: usize, ran: bool) -> Outcome {
    match result {
        // a replay must carry the response of its own key
        Ok(value) if value["key"] != key => Outcome::Failed,
        Ok(_) if ran => Outcome::Executed,
        Ok(_) => Outcome::Replayed,
        Err(GuardError::Duplicate(_)) => Outcome::Rejected,
        Err(_) => Outcome::Failed,
    }
}
