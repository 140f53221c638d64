//! Configuration loading and validation.
//!
//! Loads `connsync.toml` (path from `--config`, `$CONNSYNC_CONFIG_PATH`, or
//! the working directory). Every section has defaults, so a missing or
//! empty file is valid.
//!
//! Precedence: env vars > config file > defaults.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::reconcile::scheduler::parse_schedule;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "CONNSYNC_CONFIG_PATH";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnsyncConfig {
    /// Reconcile cadence and fan-out.
    pub sync: SyncConfig,
    /// Where the cluster registry is read from.
    pub store: StoreConfig,
    /// Identity of this node in log output.
    pub node: NodeConfig,
    /// Log filtering and file output.
    pub logging: LoggingConfig,
}

/// Reconcile cadence and fan-out.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Cron expression, seconds field first.
    pub schedule: String,
    /// Maximum open/close actions in flight during one pass.
    pub max_concurrency: usize,
    /// Run a pass as soon as the daemon starts.
    pub run_on_start: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            schedule: default_schedule(),
            max_concurrency: default_max_concurrency(),
            run_on_start: true,
        }
    }
}

/// Cluster registry location.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON registry snapshot file.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("registry.json"),
        }
    }
}

/// Node identity.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name attached to log events from this node.
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "local".to_owned(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for daily-rotated JSON logs. Console only when unset.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            dir: None,
        }
    }
}

impl ConnsyncConfig {
    /// Load with precedence env vars > TOML file > defaults, then validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if the resulting configuration is invalid.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let env = |key: &str| std::env::var(key).ok();
        let path = config_path_with(explicit, env);
        let mut config = Self::load_from_path(&path)?;
        config.apply_overrides(env);
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file only. A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::debug!(path = %path.display(), "loading config from file");
                toml::from_str(&contents)
                    .with_context(|| format!("failed to parse config at {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Parse a TOML string (no env overrides, no validation).
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML does not parse.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Apply environment overrides through `env` (injectable for tests).
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("CONNSYNC_SCHEDULE") {
            self.sync.schedule = v;
        }
        if let Some(v) = env("CONNSYNC_MAX_CONCURRENCY") {
            match v.parse() {
                Ok(n) => self.sync.max_concurrency = n,
                Err(_) => tracing::warn!(
                    var = "CONNSYNC_MAX_CONCURRENCY",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("CONNSYNC_STORE_PATH") {
            self.store.path = PathBuf::from(v);
        }
        if let Some(v) = env("CONNSYNC_NODE_NAME") {
            self.node.name = v;
        }
        if let Some(v) = env("CONNSYNC_LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    /// Reject values the daemon cannot start with.
    ///
    /// # Errors
    ///
    /// Returns an error for an unparsable schedule, a zero concurrency
    /// limit, or an empty node name.
    pub fn validate(&self) -> anyhow::Result<()> {
        parse_schedule(&self.sync.schedule).context("sync.schedule is invalid")?;
        anyhow::ensure!(
            self.sync.max_concurrency >= 1,
            "sync.max_concurrency must be >= 1"
        );
        anyhow::ensure!(
            !self.node.name.trim().is_empty(),
            "node.name must not be empty"
        );
        Ok(())
    }
}

/// Resolve the config path: explicit flag, then env, then `./connsync.toml`.
pub fn config_path_with(
    explicit: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    if let Some(p) = env(CONFIG_PATH_ENV) {
        return PathBuf::from(p);
    }
    PathBuf::from("connsync.toml")
}

// Default value functions.

fn default_schedule() -> String {
    "*/30 * * * * *".to_owned()
}

fn default_max_concurrency() -> usize {
    16
}
