//! Local sinks for the telemetry emitted by guarded calls.
//!
//! A stresstest can run with sentry, JSON logs and statsd metrics enabled, so that their cost is
//! part of the measured latencies. Instead of a real server, everything is reported into sinks
//! on localhost which count what they receive. The counts end up in the workload report.

use std::collections::BTreeMap;
use std::env;
use std::future::Future;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use repeatguard_service::metrics;
use tracing_subscriber::fmt::fmt;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;

/// Metric packets that carry no `operation` tag, like `lock.claim`.
pub const UNTAGGED: &str = "<untagged>";

type Sink = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Default)]
pub struct Config {
    pub backtraces: bool,
    pub sentry: bool,
    pub tracing: bool,
    pub metrics: bool,
}

/// What the local sinks received so far.
#[derive(Debug, Default)]
pub struct Telemetry {
    sentry_requests: AtomicUsize,
    log_bytes: AtomicUsize,
    metric_packets: Mutex<BTreeMap<String, usize>>,
}

impl Telemetry {
    /// Requests made to the sentry sink, one per envelope.
    pub fn sentry_requests(&self) -> usize {
        self.sentry_requests.load(Ordering::Relaxed)
    }

    /// Bytes of JSON logs that were formatted.
    pub fn log_bytes(&self) -> usize {
        self.log_bytes.load(Ordering::Relaxed)
    }

    /// Statsd packets received for `operation`, see [`UNTAGGED`].
    pub fn metric_packets(&self, operation: &str) -> usize {
        let packets = self
            .metric_packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        packets.get(operation).copied().unwrap_or_default()
    }

    /// Statsd packets received in total.
    pub fn total_metric_packets(&self) -> usize {
        let packets = self
            .metric_packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        packets.values().sum()
    }

    fn record_packet(&self, packet: &[u8]) {
        let operation = std::str::from_utf8(packet)
            .ok()
            .and_then(operation_tag)
            .unwrap_or(UNTAGGED);

        let mut packets = self
            .metric_packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match packets.get_mut(operation) {
            Some(count) => *count += 1,
            None => {
                packets.insert(operation.to_owned(), 1);
            }
        }
    }
}

/// Extracts the `operation` tag of a statsd packet such as
/// `repeatguard.guard.access:1|c|#operation:workload-0,host:stresstest`.
fn operation_tag(packet: &str) -> Option<&str> {
    let (_, tags) = packet.split_once("|#")?;
    tags.split(',')
        .find_map(|tag| tag.trim_end().strip_prefix("operation:"))
}

/// Keeps sentry alive and holds the sinks, which have to be spawned on the runtime.
#[derive(Default)]
pub struct Guard {
    sentry: Option<sentry::ClientInitGuard>,
    pub telemetry: Arc<Telemetry>,
    pub sinks: Vec<Sink>,
}

/// Sets up sentry, tracing and metrics, all reporting into local counting sinks.
///
/// # Safety
/// This function uses [`std::env::set_var`] and may only be called in a single-threaded context.
pub unsafe fn init(config: Config) -> Result<Guard> {
    if config.backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let mut guard = Guard::default();

    if config.sentry {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .context("failed to bind the sentry sink")?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();

        let telemetry = Arc::clone(&guard.telemetry);
        guard.sinks.push(Box::pin(async move {
            let app = axum::Router::new().fallback(move || {
                telemetry.sentry_requests.fetch_add(1, Ordering::Relaxed);
                async { "OK" }
            });
            match tokio::net::TcpListener::from_std(listener) {
                Ok(listener) => axum::serve(listener, app).await.ok(),
                Err(error) => {
                    eprintln!("sentry sink failed: {error}");
                    None
                }
            };
        }));

        guard.sentry = Some(sentry::init((
            format!("http://some_token@127.0.0.1:{port}/1234"),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                traces_sample_rate: 1.0,
                ..Default::default()
            },
        )));
    }

    if config.tracing {
        let telemetry = Arc::clone(&guard.telemetry);
        // the production JSON format, formatted into a counter instead of a terminal
        fmt()
            .with_timer(UtcTime::rfc_3339())
            .with_target(true)
            .with_env_filter("INFO,repeatguard_service=DEBUG")
            .with_writer(move || CountingWriter(Arc::clone(&telemetry)))
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .finish()
            .with(sentry::integrations::tracing::layer())
            .init();
    }

    if config.metrics {
        let socket = UdpSocket::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .context("failed to bind the metrics sink")?;
        socket.set_nonblocking(true)?;
        let host = socket.local_addr()?;

        let telemetry = Arc::clone(&guard.telemetry);
        guard.sinks.push(Box::pin(async move {
            let socket = match tokio::net::UdpSocket::from_std(socket) {
                Ok(socket) => socket,
                Err(error) => {
                    eprintln!("metrics sink failed: {error}");
                    return;
                }
            };
            let mut buf = Vec::with_capacity(2048);
            loop {
                buf.clear();
                if socket.recv_buf(&mut buf).await.is_err() {
                    break;
                }
                telemetry.record_packet(&buf);
            }
        }));

        let mut tags = BTreeMap::new();
        tags.insert("host".into(), "stresstest".into());
        tags.insert("env".into(), "stresstest".into());

        metrics::configure_statsd("repeatguard", host, tags)?;
    }

    Ok(guard)
}

/// Discards formatted log lines, counting their bytes.
struct CountingWriter(Arc<Telemetry>);

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.log_bytes.fetch_add(buf.len(), Ordering::Relaxed);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
