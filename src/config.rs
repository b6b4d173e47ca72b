use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub data: DataConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub narratives: NarrativeConfig,
    #[serde(default)]
    pub failures: FailureConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LockConfig {
    /// Total wait budget for one lock acquisition.
    #[serde(default = "default_lock_timeout_ms")]
    pub timeout_ms: u64,
    /// Age past which an unreadable lock sidecar may be reclaimed.
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_lock_timeout_ms(),
            staleness_secs: default_staleness_secs(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}
fn default_staleness_secs() -> u64 {
    60
}
fn default_initial_backoff_ms() -> u64 {
    50
}
fn default_max_backoff_ms() -> u64 {
    1_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct NarrativeConfig {
    /// How many recent bookmark IDs each narrative keeps (most-recent-last).
    #[serde(default = "default_recent_ids_cap")]
    pub recent_ids_cap: usize,
}

impl Default for NarrativeConfig {
    fn default() -> Self {
        Self {
            recent_ids_cap: default_recent_ids_cap(),
        }
    }
}

fn default_recent_ids_cap() -> usize {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct FailureConfig {
    /// Attempts after which an item becomes a poison pill.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_secs: default_base_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}
fn default_base_backoff_secs() -> u64 {
    60
}
fn default_max_backoff_secs() -> u64 {
    21_600
}

impl Config {
    /// Build a config with defaults everywhere except the data directory.
    pub fn with_data_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            data: DataConfig { dir: dir.into() },
            lock: LockConfig::default(),
            narratives: NarrativeConfig::default(),
            failures: FailureConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.data.dir.as_os_str().is_empty() {
        anyhow::bail!("data.dir must not be empty");
    }

    if config.lock.timeout_ms == 0 {
        anyhow::bail!("lock.timeout_ms must be > 0");
    }
    if config.lock.initial_backoff_ms == 0 {
        anyhow::bail!("lock.initial_backoff_ms must be > 0");
    }
    if config.lock.initial_backoff_ms > config.lock.max_backoff_ms {
        anyhow::bail!("lock.initial_backoff_ms must be <= lock.max_backoff_ms");
    }

    if config.narratives.recent_ids_cap < 1 {
        anyhow::bail!("narratives.recent_ids_cap must be >= 1");
    }

    if config.failures.max_retries < 1 {
        anyhow::bail!("failures.max_retries must be >= 1");
    }
    if config.failures.base_backoff_secs == 0 {
        anyhow::bail!("failures.base_backoff_secs must be > 0");
    }
    if config.failures.base_backoff_secs > config.failures.max_backoff_secs {
        anyhow::bail!("failures.base_backoff_secs must be <= failures.max_backoff_secs");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("[data]\ndir = \"/tmp/curio\"\n").unwrap();
        assert_eq!(config.lock.timeout_ms, 10_000);
        assert_eq!(config.lock.staleness_secs, 60);
        assert_eq!(config.lock.initial_backoff_ms, 50);
        assert_eq!(config.lock.max_backoff_ms, 1_000);
        assert_eq!(config.narratives.recent_ids_cap, 30);
        assert_eq!(config.failures.max_retries, 5);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = parse("[data]\ndir = \"/tmp/curio\"\n[lock]\ntimeout_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("timeout_ms"));
    }

    #[test]
    fn test_backoff_bounds_rejected() {
        let err = parse(
            "[data]\ndir = \"/tmp/curio\"\n[lock]\ninitial_backoff_ms = 2000\nmax_backoff_ms = 1000\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("initial_backoff_ms"));
    }

    #[test]
    fn test_zero_recent_cap_rejected() {
        let err =
            parse("[data]\ndir = \"/tmp/curio\"\n[narratives]\nrecent_ids_cap = 0\n").unwrap_err();
        assert!(err.to_string().contains("recent_ids_cap"));
    }
}
