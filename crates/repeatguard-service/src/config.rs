use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::backend::BackendConfig;
use crate::lock::DEFAULT_PREFIX;
use crate::policy::RepeatPolicy;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A tag name to report the environment to, for each metric. Defaults to not sending such a tag.
    ///
    /// If this is set, the environment will be read from the `REPEATGUARD_ENV` environment
    /// variable.
    pub environment_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "repeatguard".into(),
            hostname_tag: None,
            environment_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The namespace prefix of all isolation tokens.
    ///
    /// Instances sharing a backend only see each other's calls if they use the same prefix.
    pub prefix: String,

    /// Where idempotency state is kept.
    pub backend: BackendConfig,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Policies of guarded operations, keyed by operation name.
    pub operations: BTreeMap<String, RepeatPolicy>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            prefix: DEFAULT_PREFIX.into(),
            backend: BackendConfig::default(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            operations: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// The policy configured for `operation`.
    pub fn policy(&self, operation: &str) -> Option<&RepeatPolicy> {
        self.operations.get(operation)
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::policy::{DuplicateKind, Window};

    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.prefix, "TMT_");
        assert!(matches!(cfg.backend, BackendConfig::Memory(_)));
        assert_eq!(cfg.logging.level, LevelFilter::INFO);
        assert_eq!(cfg.metrics.prefix, "repeatguard");
        assert!(cfg.operations.is_empty());
    }

    #[test]
    fn test_operations() {
        let yaml = r#"
            prefix: "shop:"
            logging:
              level: debug
              format: json
            operations:
              checkout:
                window: fixed
                method_lock_ttl: 2s
                response_ttl: 1m
                use_last_response: true
                token_keys: ["/order/id"]
              refund:
                error: conflict
                message: refund already in progress
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.prefix, "shop:");
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let checkout = cfg.policy("checkout").unwrap();
        assert_eq!(checkout.window, Window::Fixed);
        assert_eq!(checkout.method_lock_ttl, Duration::from_secs(2));
        assert_eq!(checkout.response_ttl, Duration::from_secs(60));
        assert!(checkout.use_last_response);
        assert_eq!(checkout.token_keys, ["/order/id"]);

        // unspecified fields keep their defaults
        let refund = cfg.policy("refund").unwrap();
        assert_eq!(refund.window, Window::Sliding);
        assert_eq!(refund.error, DuplicateKind::Conflict);
        assert_eq!(refund.message, "refund already in progress");
        assert_eq!(refund.method_lock_ttl, RepeatPolicy::default().method_lock_ttl);

        assert!(cfg.policy("capture").is_none());
    }

    #[test]
    fn test_invalid_level() {
        let yaml = r#"
            logging:
              level: loud
        "#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            prefix: "shop:"
            lock_store: cluster
            operations:
              checkout:
                window: fixed
                retry_budget: 3
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.prefix, "shop:");
        assert_eq!(cfg.policy("checkout").unwrap().window, Window::Fixed);
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
