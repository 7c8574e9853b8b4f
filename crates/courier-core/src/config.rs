//! OutboxOptions - outbox の実行時設定
//!
//! 優先度の低い順:
//! 1. `OutboxOptions::default()`
//! 2. an `[outbox]` table in a TOML file
//! 3. `{PREFIX}_OUTBOX_*` environment variables

use std::env::{self, VarError};
use std::num::ParseIntError;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{BackoffPolicy, DefaultDecider};

pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_LEASE_DURATION_MS: u64 = 60_000;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 600_000;
pub const DEFAULT_BACKOFF_JITTER_MS: u64 = 500;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_ERROR_COOLDOWN_MS: u64 = 2_000;
/// Upper bound for lease, backoff and jitter durations (365 days).
pub const MAX_DURATION_MS: u64 = 365 * 24 * 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("environment variable {var} is not a valid number: {source}")]
    InvalidNumber {
        var: String,
        #[source]
        source: ParseIntError,
    },

    #[error("environment variable {0} is not valid unicode")]
    InvalidUnicode(String),

    #[error("invalid outbox option: {0}")]
    Invalid(String),
}

/// Outbox tuning knobs. Durations are whole milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxOptions {
    /// Messages claimed per `process_once`.
    pub batch_size: usize,
    /// Idle sleep of the worker loop.
    pub poll_interval_ms: u64,
    /// Lifetime of a claim.
    pub lease_duration_ms: u64,
    /// Cap for exponential backoff.
    pub max_backoff_ms: u64,
    /// Max random addend to a backoff delay.
    pub backoff_jitter_ms: u64,
    /// Used when enqueue does not specify max_attempts.
    pub default_max_attempts: u32,
    /// Worker loop pause after a failed iteration.
    pub error_cooldown_ms: u64,
}

impl Default for OutboxOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            lease_duration_ms: DEFAULT_LEASE_DURATION_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            backoff_jitter_ms: DEFAULT_BACKOFF_JITTER_MS,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            error_cooldown_ms: DEFAULT_ERROR_COOLDOWN_MS,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct OptionsFile {
    #[serde(default)]
    outbox: OutboxOptions,
}

impl OutboxOptions {
    /// Parse the `[outbox]` table of a TOML document. Missing keys keep their
    /// defaults; other tables are ignored.
    pub fn from_toml_str(doc: &str) -> Result<Self, ConfigError> {
        let file: OptionsFile = toml::from_str(doc)?;
        Ok(file.outbox)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let doc = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&doc)
    }

    /// Defaults, then the optional file, then the environment. Validated.
    pub fn load(path: Option<&Path>, env_prefix: &str) -> Result<Self, ConfigError> {
        let mut options = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        options.apply_env(env_prefix)?;
        options.validate()?;
        Ok(options)
    }

    /// Override fields from `{PREFIX}_OUTBOX_*` variables.
    ///
    /// Expected variables (all optional):
    /// - `{PREFIX}_OUTBOX_BATCH_SIZE`
    /// - `{PREFIX}_OUTBOX_POLL_INTERVAL_MS`
    /// - `{PREFIX}_OUTBOX_LEASE_DURATION_MS`
    /// - `{PREFIX}_OUTBOX_MAX_BACKOFF_MS`
    /// - `{PREFIX}_OUTBOX_BACKOFF_JITTER_MS`
    /// - `{PREFIX}_OUTBOX_DEFAULT_MAX_ATTEMPTS`
    /// - `{PREFIX}_OUTBOX_ERROR_COOLDOWN_MS`
    pub fn apply_env(&mut self, prefix: &str) -> Result<(), ConfigError> {
        self.apply_vars(prefix, |name| match env::var(name) {
            Ok(value) => Ok(Some(value)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => Err(ConfigError::InvalidUnicode(name.to_owned())),
        })
    }

    /// Same as `apply_env`, reading variables through `lookup`.
    pub fn apply_vars<F>(&mut self, prefix: &str, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Result<Option<String>, ConfigError>,
    {
        let read = |suffix: &str| -> Result<Option<(String, String)>, ConfigError> {
            let var = format!("{prefix}_OUTBOX_{suffix}");
            match lookup(&var)? {
                Some(value) if !value.trim().is_empty() => Ok(Some((var, value.trim().to_owned()))),
                _ => Ok(None),
            }
        };

        if let Some(v) = parse(read("BATCH_SIZE")?)? {
            self.batch_size = v;
        }
        if let Some(v) = parse(read("POLL_INTERVAL_MS")?)? {
            self.poll_interval_ms = v;
        }
        if let Some(v) = parse(read("LEASE_DURATION_MS")?)? {
            self.lease_duration_ms = v;
        }
        if let Some(v) = parse(read("MAX_BACKOFF_MS")?)? {
            self.max_backoff_ms = v;
        }
        if let Some(v) = parse(read("BACKOFF_JITTER_MS")?)? {
            self.backoff_jitter_ms = v;
        }
        if let Some(v) = parse(read("DEFAULT_MAX_ATTEMPTS")?)? {
            self.default_max_attempts = v;
        }
        if let Some(v) = parse(read("ERROR_COOLDOWN_MS")?)? {
            self.error_cooldown_ms = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be greater than 0".into()));
        }
        if self.lease_duration_ms == 0 {
            return Err(ConfigError::Invalid(
                "lease_duration_ms must be greater than 0".into(),
            ));
        }
        if self.default_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "default_max_attempts must be greater than 0".into(),
            ));
        }
        for (name, value) in [
            ("lease_duration_ms", self.lease_duration_ms),
            ("max_backoff_ms", self.max_backoff_ms),
            ("backoff_jitter_ms", self.backoff_jitter_ms),
        ] {
            if value > MAX_DURATION_MS {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be at most {MAX_DURATION_MS}, got {value}"
                )));
            }
        }
        Ok(())
    }

    #[inline]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[inline]
    pub const fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    #[inline]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    #[inline]
    pub const fn backoff_jitter(&self) -> Duration {
        Duration::from_millis(self.backoff_jitter_ms)
    }

    #[inline]
    pub const fn error_cooldown(&self) -> Duration {
        Duration::from_millis(self.error_cooldown_ms)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.max_backoff(), self.backoff_jitter())
    }

    pub fn decider(&self) -> DefaultDecider {
        DefaultDecider::new(self.backoff_policy())
    }
}

fn parse<T>(entry: Option<(String, String)>) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr<Err = ParseIntError>,
{
    match entry {
        None => Ok(None),
        Some((var, value)) => value
            .parse()
            .map(Some)
            .map_err(|source| ConfigError::InvalidNumber { var, source }),
    }
}
