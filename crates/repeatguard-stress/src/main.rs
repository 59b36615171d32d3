use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use repeatguard_service::config::Config;

mod stresstest;
mod telemetry;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Report to a local sentry sink, counting the envelopes it receives.
    #[arg(long)]
    sentry: bool,

    /// Run the full JSON logging machinery, counting the bytes it formats.
    #[arg(long)]
    tracing: bool,

    /// Send metrics to a local statsd sink, counting packets per workload.
    #[arg(long)]
    metrics: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    let telemetry_config = telemetry::Config {
        backtraces: config.logging.enable_backtraces,
        sentry: cli.sentry,
        tracing: cli.tracing,
        metrics: cli.metrics,
    };
    // SAFETY: the runtime is only started below.
    let mut telemetry_guard = unsafe { telemetry::init(telemetry_config) }?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(async {
        for sink in telemetry_guard.sinks.drain(..) {
            tokio::spawn(sink);
        }

        perform_stresstest(config, workloads, cli.duration, &telemetry_guard.telemetry).await
    })
}
