//! Configuration snapshot and change notification.
//!
//! The runner consumes immutable snapshots through a watch channel;
//! whoever drives reconfiguration (an admin layer, tests) holds the
//! [`ConfigHandle`]. Every mutation validates the whole snapshot
//! before publishing it.

use crate::judge::Rule;
use crate::machine::MachineConfig;
use crate::source::SourceConfig;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("source `{id}`: {reason}")]
    InvalidSource { id: String, reason: String },
    #[error("machine `{id}`: {reason}")]
    InvalidMachine { id: String, reason: String },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub machines: Vec<MachineConfig>,
    #[serde(default)]
    pub classifier_rule: Rule,
    /// Runner tick in milliseconds, 200..=5000.
    #[serde(default = "default_base_tick_ms")]
    pub base_tick_ms: u64,
    /// After repeated fetch failures: wait and resume (true) or stop
    /// until reconfigured (false).
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default = "default_fail_wait_minutes")]
    pub fail_wait_minutes: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_base_tick_ms() -> u64 {
    800
}
fn default_true() -> bool {
    true
}
fn default_fail_wait_minutes() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            machines: Vec::new(),
            classifier_rule: Rule::default(),
            base_tick_ms: default_base_tick_ms(),
            auto_restart: true,
            fail_wait_minutes: default_fail_wait_minutes(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(200..=5000).contains(&self.base_tick_ms) {
            return Err(ConfigError::Invalid(format!(
                "base_tick_ms {} outside 200..=5000",
                self.base_tick_ms
            )));
        }

        let mut source_ids = HashSet::new();
        for src in &self.sources {
            let fail = |reason: String| ConfigError::InvalidSource {
                id: src.id.clone(),
                reason,
            };
            if src.id.trim().is_empty() {
                return Err(fail("empty id".to_string()));
            }
            if !source_ids.insert(src.id.as_str()) {
                return Err(fail("duplicate id".to_string()));
            }
            if src.url.trim().is_empty() {
                return Err(fail("empty url".to_string()));
            }
            if src.base_rps < 1 || src.base_rps > src.max_rps || src.max_rps > 100 {
                return Err(fail(format!(
                    "rps bounds violated: 1 <= base ({}) <= max ({}) <= 100",
                    src.base_rps, src.max_rps
                )));
            }
            if !(500..=30_000).contains(&src.timeout_ms) {
                return Err(fail(format!(
                    "timeout_ms {} outside 500..=30000",
                    src.timeout_ms
                )));
            }
        }

        let mut machine_ids = HashSet::new();
        for m in &self.machines {
            let fail = |reason: String| ConfigError::InvalidMachine {
                id: m.id.clone(),
                reason,
            };
            if m.id.trim().is_empty() {
                return Err(fail("empty id".to_string()));
            }
            if !machine_ids.insert(m.id.as_str()) {
                return Err(fail("duplicate id".to_string()));
            }
            if m.trigger_count < 1 {
                return Err(fail("trigger_count must be >= 1".to_string()));
            }
            if m.hit_offset < 1 {
                return Err(fail("hit_offset must be >= 1".to_string()));
            }
        }

        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.base_tick_ms)
    }

    pub fn fail_wait(&self) -> Duration {
        Duration::from_secs(self.fail_wait_minutes * 60)
    }
}

/// Writer side of the config channel.
pub struct ConfigHandle {
    tx: watch::Sender<Arc<AppConfig>>,
}

impl ConfigHandle {
    /// Publish a whole new snapshot.
    pub fn update(&self, config: AppConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.tx.send_replace(Arc::new(config));
        Ok(())
    }

    /// Switch the classifier rule, keeping everything else.
    pub fn set_rule(&self, rule: Rule) {
        let mut next = AppConfig::clone(&self.tx.borrow());
        next.classifier_rule = rule;
        self.tx.send_replace(Arc::new(next));
    }

    pub fn current(&self) -> Arc<AppConfig> {
        Arc::clone(&self.tx.borrow())
    }
}

/// Build the config channel from a validated initial snapshot.
pub fn channel(
    initial: AppConfig,
) -> Result<(ConfigHandle, watch::Receiver<Arc<AppConfig>>), ConfigError> {
    initial.validate()?;
    let (tx, rx) = watch::channel(Arc::new(initial));
    Ok((ConfigHandle { tx }, rx))
}
