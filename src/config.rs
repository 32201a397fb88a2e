//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/scoreport.sqlite"
//!
//! [import]
//! lock_ttl_secs = 600
//! heartbeat_every = 50
//! background = false
//!
//! [orphans]
//! max_attempts = 30
//! retry_backoff_secs = 3600
//! sweep_interval_secs = 86400
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```
//!
//! Only `[db]` is required; every other section has defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use scoreport_core::import::ImportSettings;
use scoreport_core::reconcile::ReconcilePolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub orphans: OrphansConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImportConfig {
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_heartbeat_every")]
    pub heartbeat_every: usize,
    /// Dispatch `scoreport import` to a background task and print the
    /// import ID instead of waiting.
    #[serde(default)]
    pub background: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl_secs(),
            heartbeat_every: default_heartbeat_every(),
            background: false,
        }
    }
}

fn default_lock_ttl_secs() -> u64 {
    600
}
fn default_heartbeat_every() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrphansConfig {
    /// Absent means orphans are retried forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for OrphansConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            retry_backoff_secs: 0,
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    86400
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Config with defaults everywhere and the database at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            import: ImportConfig::default(),
            orphans: OrphansConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn import_settings(&self) -> ImportSettings {
        ImportSettings {
            lock_ttl: Duration::from_secs(self.import.lock_ttl_secs),
            heartbeat_every: self.import.heartbeat_every,
        }
    }

    pub fn reconcile_policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            max_attempts: self.orphans.max_attempts,
            backoff: Duration::from_secs(self.orphans.retry_backoff_secs),
            lock_ttl: Duration::from_secs(self.import.lock_ttl_secs),
            heartbeat_every: self.import.heartbeat_every,
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

pub fn validate(config: &Config) -> Result<()> {
    if config.import.lock_ttl_secs == 0 {
        anyhow::bail!("import.lock_ttl_secs must be > 0");
    }
    if config.import.heartbeat_every == 0 {
        anyhow::bail!("import.heartbeat_every must be > 0");
    }
    if config.orphans.max_attempts == Some(0) {
        anyhow::bail!("orphans.max_attempts must be > 0 when set");
    }
    if config.orphans.sweep_interval_secs == 0 {
        anyhow::bail!("orphans.sweep_interval_secs must be > 0");
    }

    match config.logging.format.as_str() {
        "pretty" | "json" => {}
        other => anyhow::bail!(
            "Unknown logging.format: '{}'. Must be pretty or json.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg: Config = toml::from_str("[db]\npath = \"x.sqlite\"\n").unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.import.lock_ttl_secs, 600);
        assert_eq!(cfg.import.heartbeat_every, 50);
        assert!(!cfg.import.background);
        assert_eq!(cfg.orphans.max_attempts, None);
        assert_eq!(cfg.orphans.sweep_interval_secs, 86400);
        assert_eq!(cfg.logging.format, "pretty");
        assert_eq!(cfg.reconcile_policy().backoff, Duration::ZERO);
    }

    #[test]
    fn test_rejects_zero_ttl() {
        let cfg: Config =
            toml::from_str("[db]\npath = \"x.sqlite\"\n[import]\nlock_ttl_secs = 0\n").unwrap();
        let err = validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("import.lock_ttl_secs"));
    }

    #[test]
    fn test_rejects_zero_max_attempts() {
        let cfg: Config =
            toml::from_str("[db]\npath = \"x.sqlite\"\n[orphans]\nmax_attempts = 0\n").unwrap();
        assert!(validate(&cfg)
            .unwrap_err()
            .to_string()
            .contains("orphans.max_attempts"));
    }

    #[test]
    fn test_rejects_unknown_log_format() {
        let cfg: Config =
            toml::from_str("[db]\npath = \"x.sqlite\"\n[logging]\nformat = \"xml\"\n").unwrap();
        assert!(validate(&cfg).is_err());
    }
}
