//! Configuration management for the ledger node

use serde::Deserialize;
use thiserror::Error;

use std::fs;
use std::io;
use std::path::Path;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "LEDGER_CONFIG";

/// Configuration file used when the environment variable is unset
pub const DEFAULT_CONFIG_PATH: &str = "ledger.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Leading zero hex characters required in a block hash
    #[serde(default = "default_difficulty")]
    pub difficulty: usize,
    #[serde(default = "default_mining_reward")]
    pub mining_reward: f64,
    /// Balance credited to every newly registered account
    #[serde(default = "default_opening_balance")]
    pub opening_balance: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub path: String,
    /// Run without persistence
    #[serde(default)]
    pub in_memory: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            difficulty: default_difficulty(),
            mining_reward: default_mining_reward(),
            opening_balance: default_opening_balance(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_data_dir(),
            in_memory: false,
        }
    }
}

fn default_difficulty() -> usize {
    4
}

fn default_mining_reward() -> f64 {
    10.0
}

fn default_opening_balance() -> f64 {
    50.0
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> String {
    "data/ledger".to_string()
}

impl Config {
    /// Loads the file named by `LEDGER_CONFIG`, falling back to `ledger.toml`.
    /// A missing file means defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(path)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let config = Config::default();
                config.validate()?;
                Ok(config)
            }
            Err(source) => Err(ConfigError::Read {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=64).contains(&self.ledger.difficulty) {
            return Err(ConfigError::Invalid(format!(
                "ledger.difficulty must be between 1 and 64, got {}",
                self.ledger.difficulty
            )));
        }

        if !self.ledger.mining_reward.is_finite() || self.ledger.mining_reward <= 0.0 {
            return Err(ConfigError::Invalid("ledger.mining_reward must be a positive number".into()));
        }

        if !self.ledger.opening_balance.is_finite() || self.ledger.opening_balance < 0.0 {
            return Err(ConfigError::Invalid("ledger.opening_balance must be a non-negative number".into()));
        }

        if !self.storage.in_memory && self.storage.path.trim().is_empty() {
            return Err(ConfigError::Invalid("storage.path must be set".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();

        assert_eq!(config.ledger.difficulty, 4);
        assert_eq!(config.ledger.mining_reward, 10.0);
        assert_eq!(config.ledger.opening_balance, 50.0);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.storage.path, "data/ledger");
        assert!(!config.storage.in_memory);
    }

    #[test]
    fn test_partial_override() {
        let config = Config::parse(
            r#"
            [ledger]
            difficulty = 2

            [server]
            port = 9000
            "#,
        )
        .unwrap();

        assert_eq!(config.ledger.difficulty, 2);
        assert_eq!(config.ledger.mining_reward, 10.0);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            Config::parse("[ledger]\ndifficulty = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::parse("[ledger]\nmining_reward = -1.0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::parse("[ledger]\nmining_reward = 0.0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::parse("[storage]\npath = \"\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(Config::parse("[ledger\n"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.ledger.difficulty, 4);
    }
}
