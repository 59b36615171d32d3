//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use repeatguard_service::config::Config;
use repeatguard_service::{IdempotencyLock, backend, metrics};

use crate::commands;
use crate::logging;

/// Repeatguard commands.
#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Print the isolation token of a uniqueness key.
    ///
    /// With `--operation`, prints the tokens of the method lock and the cached response of that
    /// operation instead.
    Token {
        key: String,
        #[arg(long)]
        operation: Option<String>,
    },

    /// Claim a key.
    ///
    /// Without `--value`, only checks whether the key is already claimed.
    Claim {
        key: String,
        #[arg(long)]
        value: Option<String>,
        #[arg(long, value_parser = humantime::parse_duration)]
        ttl: Duration,
        /// Use a fixed window, do not extend the TTL of an existing entry.
        #[arg(long)]
        fixed: bool,
    },

    /// Print the value stored for a key.
    Peek { key: String },

    /// Re-arm the TTL of a key.
    Refresh {
        key: String,
        #[arg(long, value_parser = humantime::parse_duration)]
        ttl: Duration,
    },

    /// Delete a key.
    Release { key: String },

    /// Show the method lock and cached response of a guarded call.
    Inspect {
        key: String,
        #[arg(long)]
        operation: String,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: we are in a single-threaded context, the runtime is only started below.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();

        if let Some(hostname_tag) = config.metrics.hostname_tag.clone() {
            if tags.contains_key(&hostname_tag) {
                tracing::warn!(
                    "tag {} defined both as hostname tag and as a custom tag",
                    hostname_tag
                );
            }
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(hostname_tag, hostname);
            }
        }
        if let Some(environment_tag) = config.metrics.environment_tag.clone() {
            if let Some(environment) = sentry.options().environment.as_ref() {
                tags.insert(environment_tag, environment.to_string());
            }
        }

        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(async {
        let backend = backend::from_config(&config.backend)
            .await
            .context("failed to connect to the backend")?;
        let lock = IdempotencyLock::with_prefix(backend, config.prefix.as_str());

        let output = commands::run(&lock, cli.command).await?;
        println!("{output}");
        Ok(())
    })
}
