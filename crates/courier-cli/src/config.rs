//! CLI configuration: database url, logging and the `[outbox]` table.
//!
//! Sources, lowest priority first: defaults, TOML file, `COURIER_*`
//! environment variables.

use std::path::Path;

use anyhow::{Context, Result};
use courier_core::OutboxOptions;
use serde::Deserialize;

pub const ENV_PREFIX: &str = "COURIER";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://courier.db";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub database_url: String,
    pub log: LogConfig,
    pub outbox: OutboxOptions,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            log: LogConfig::default(),
            outbox: OutboxOptions::default(),
        }
    }
}

impl CliConfig {
    pub fn from_toml_str(doc: &str) -> Result<Self> {
        toml::from_str(doc).context("failed to parse config")
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let doc = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                Self::from_toml_str(&doc)?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.outbox.validate()?;
        Ok(config)
    }

    /// Expected variables (all optional):
    /// - `COURIER_DATABASE_URL`
    /// - `COURIER_LOG_LEVEL`
    /// - `COURIER_LOG_JSON` (`true` / `false`)
    /// - `COURIER_OUTBOX_*` (see `OutboxOptions::apply_env`)
    fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| {
            lookup(&format!("{ENV_PREFIX}_{suffix}")).filter(|v| !v.trim().is_empty())
        };

        if let Some(url) = var("DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(json) = var("LOG_JSON") {
            self.log.json = json
                .trim()
                .parse()
                .with_context(|| format!("{ENV_PREFIX}_LOG_JSON must be true or false, got {json:?}"))?;
        }
        self.outbox
            .apply_vars(ENV_PREFIX, |name| Ok(lookup(name)))?;
        Ok(())
    }
}
