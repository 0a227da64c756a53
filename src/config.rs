use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::scheduler::{ResourceScope, SchedulerConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { key: String, value: String, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { key, value, reason } => write!(f, "{key}={value:?}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Process configuration, read from `FLEETBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub timezone: Tz,
    pub scheduler_enabled: bool,
    pub scheduler: SchedulerConfig,
    pub webhook_url: Option<String>,
    pub webhook_timeout: Duration,
    pub webhook_queue: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        let Some(value) = self.raw(key) else {
            return Ok(None);
        };
        value.trim().parse().map(Some).map_err(|e: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            reason: e.to_string(),
            value,
        })
    }

    fn millis(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        let ms: Option<u64> = self.parsed(key)?;
        match ms {
            Some(0) => Err(ConfigError::Invalid {
                key: key.to_string(),
                value: "0".into(),
                reason: "must be greater than zero".into(),
            }),
            other => Ok(other.map(Duration::from_millis)),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup };

        let reminder_hour: u32 = env.parsed("FLEETBOOK_REMINDER_HOUR")?.unwrap_or(9);
        if reminder_hour > 23 {
            return Err(ConfigError::Invalid {
                key: "FLEETBOOK_REMINDER_HOUR".into(),
                value: reminder_hour.to_string(),
                reason: "must be between 0 and 23".into(),
            });
        }

        let scope = match env.raw("FLEETBOOK_RESOURCE_KEYS") {
            None => ResourceScope::All,
            Some(list) => ResourceScope::Keys(
                list.split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(String::from)
                    .collect(),
            ),
        };

        let timezone = match env.raw("FLEETBOOK_TIMEZONE") {
            None => Tz::UTC,
            Some(name) => name.trim().parse::<Tz>().map_err(|e| ConfigError::Invalid {
                key: "FLEETBOOK_TIMEZONE".into(),
                reason: format!("{e}"),
                value: name,
            })?,
        };

        Ok(Config {
            data_dir: env.raw("FLEETBOOK_DATA_DIR").map_or_else(|| PathBuf::from("./data"), PathBuf::from),
            timezone,
            scheduler_enabled: env.parsed("FLEETBOOK_SCHEDULER_ENABLED")?.unwrap_or(true),
            scheduler: SchedulerConfig {
                interval: env.millis("FLEETBOOK_TICK_INTERVAL_MS")?.unwrap_or(Duration::from_secs(5)),
                pass_timeout: env.millis("FLEETBOOK_PASS_TIMEOUT_MS")?,
                scope,
                reminder_hour,
            },
            webhook_url: env.raw("FLEETBOOK_WEBHOOK_URL"),
            webhook_timeout: env.millis("FLEETBOOK_WEBHOOK_TIMEOUT_MS")?.unwrap_or(Duration::from_secs(5)),
            webhook_queue: env.parsed("FLEETBOOK_WEBHOOK_QUEUE")?.unwrap_or(256),
            compact_threshold: env.parsed("FLEETBOOK_COMPACT_THRESHOLD")?.unwrap_or(1000),
            metrics_port: env.parsed("FLEETBOOK_METRICS_PORT")?,
        })
    }
}
