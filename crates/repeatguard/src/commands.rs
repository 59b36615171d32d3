use std::fmt::Write;
use std::time::Duration;

use anyhow::{Context, Result};

use repeatguard_service::lock::{method_lock_key, response_key};
use repeatguard_service::{CachedResponse, IdempotencyLock, Window};

use crate::cli::Command;

/// Runs a single command against `lock`, returning what should be printed.
pub async fn run(lock: &IdempotencyLock, command: Command) -> Result<String> {
    let output = match command {
        Command::Token { key, operation } => match operation {
            None => lock.isolate(&key),
            Some(operation) => {
                let method_key = method_lock_key(&key, &operation);
                let response_key = response_key(lock.prefix(), &method_key);
                format!(
                    "method lock: {}\nresponse:    {}",
                    lock.isolate(&method_key),
                    lock.isolate(&response_key)
                )
            }
        },
        Command::Claim {
            key,
            value,
            ttl,
            fixed,
        } => {
            let window = if fixed { Window::Fixed } else { Window::Sliding };
            let claimed = lock.claim(&key, value.as_deref(), ttl, window).await?;
            match (value.is_some(), claimed) {
                (true, true) => "claimed",
                (true, false) => "already claimed",
                (false, true) => "present",
                (false, false) => "absent",
            }
            .to_owned()
        }
        Command::Peek { key } => lock
            .peek(&key)
            .await?
            .unwrap_or_else(|| "<absent>".to_owned()),
        Command::Refresh { key, ttl } => {
            lock.refresh(&key, ttl).await?;
            "refreshed".to_owned()
        }
        Command::Release { key } => {
            let released = lock.release(&key).await?;
            if released { "released" } else { "<absent>" }.to_owned()
        }
        Command::Inspect { key, operation } => inspect(lock, &key, &operation).await?,
    };

    Ok(output)
}

async fn inspect(lock: &IdempotencyLock, key: &str, operation: &str) -> Result<String> {
    let method_key = method_lock_key(key, operation);
    let response_key = response_key(lock.prefix(), &method_key);

    let mut output = String::new();
    let held = lock.peek(&method_key).await?.is_some();
    writeln!(output, "method lock: {}", if held { "held" } else { "free" })?;

    let Some(raw) = lock.peek(&response_key).await? else {
        write!(output, "response: <absent>")?;
        return Ok(output);
    };
    let response = CachedResponse::from_json(&raw).context("corrupt response entry")?;
    let payload = response.payload().context("corrupt response payload")?;

    writeln!(output, "response:")?;
    writeln!(output, "  type: {}", response.type_name)?;
    if let Some(created_at) = response.created_at {
        writeln!(output, "  created: {}", created_at.to_rfc3339())?;
        writeln!(
            output,
            "  age: {}",
            humantime::format_duration(Duration::from_secs(response.age().as_secs()))
        )?;
    }
    write!(
        output,
        "  payload: {}",
        serde_json::to_string_pretty(&payload)?.replace('\n', "\n  ")
    )?;

    Ok(output)
}
