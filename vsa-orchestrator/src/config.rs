//! Configuration for the orchestration engine.
//!
//! Loads configuration from an optional TOML file with environment variable
//! overrides (`VSA__MONITOR__TIMEOUT_SECS=600`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub cbt: CbtConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Delay between job status polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Wall-clock budget for one wait on a job
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// PENDING observations tolerated before the job is killed
    #[serde(default = "default_pending_retries")]
    pub pending_retries: u32,

    /// SUSPENDED observations resumed before the job is killed
    #[serde(default = "default_suspend_resumes")]
    pub suspend_resumes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Restore workers allowed to run at once in parallel mode
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Root directory guest-file and disk restores write under
    #[serde(default = "default_restore_root")]
    pub restore_root: String,

    /// Minimum free space asked of the placement oracle
    #[serde(default)]
    pub min_free_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CbtConfig {
    /// Wait budget for synthetic-full parent job links to appear
    #[serde(default = "default_link_timeout_secs")]
    pub link_timeout_secs: u64,

    #[serde(default = "default_link_poll_ms")]
    pub link_poll_ms: u64,

    /// Wait budget for delta artifacts to disappear after restore
    #[serde(default = "default_prune_timeout_secs")]
    pub prune_timeout_secs: u64,

    #[serde(default = "default_prune_poll_ms")]
    pub prune_poll_ms: u64,

    /// Incremental duration allowed as a fraction of the chain's full
    #[serde(default = "default_incremental_time_fraction")]
    pub incremental_time_fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_timeout_secs() -> u64 {
    3 * 60 * 60
}

fn default_pending_retries() -> u32 {
    3
}

fn default_suspend_resumes() -> u32 {
    3
}

fn default_max_parallel() -> usize {
    4
}

fn default_restore_root() -> String {
    "/vsa_restore".to_string()
}

fn default_link_timeout_secs() -> u64 {
    600
}

fn default_link_poll_ms() -> u64 {
    5000
}

fn default_prune_timeout_secs() -> u64 {
    300
}

fn default_prune_poll_ms() -> u64 {
    5000
}

fn default_incremental_time_fraction() -> f64 {
    0.6
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            timeout_secs: default_timeout_secs(),
            pending_retries: default_pending_retries(),
            suspend_resumes: default_suspend_resumes(),
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            restore_root: default_restore_root(),
            min_free_bytes: 0,
        }
    }
}

impl Default for CbtConfig {
    fn default() -> Self {
        Self {
            link_timeout_secs: default_link_timeout_secs(),
            link_poll_ms: default_link_poll_ms(),
            prune_timeout_secs: default_prune_timeout_secs(),
            prune_poll_ms: default_prune_poll_ms(),
            incremental_time_fraction: default_incremental_time_fraction(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl CbtConfig {
    pub fn link_timeout(&self) -> Duration {
        Duration::from_secs(self.link_timeout_secs)
    }

    pub fn link_poll(&self) -> Duration {
        Duration::from_millis(self.link_poll_ms)
    }

    pub fn prune_timeout(&self) -> Duration {
        Duration::from_secs(self.prune_timeout_secs)
    }

    pub fn prune_poll(&self) -> Duration {
        Duration::from_millis(self.prune_poll_ms)
    }
}

impl EngineConfig {
    /// Load configuration from an optional TOML file, then apply `VSA__*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("VSA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Load configuration from a TOML file only
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Short timeouts for tests and dry runs
    pub fn fast() -> Self {
        Self {
            monitor: MonitorConfig {
                poll_interval_ms: 1,
                timeout_secs: 5,
                ..MonitorConfig::default()
            },
            cbt: CbtConfig {
                link_timeout_secs: 2,
                link_poll_ms: 1,
                prune_timeout_secs: 1,
                prune_poll_ms: 1,
                ..CbtConfig::default()
            },
            ..Self::default()
        }
    }
}
