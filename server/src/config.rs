//! Configuration management for the agent.

use paysync_engine::SyncConfig;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP host address
    pub host: String,
    /// HTTP port
    pub port: u16,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Where the local cache snapshot lives
    pub snapshot_path: PathBuf,
    /// Engine settings
    pub sync: SyncConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string());

        let port = parse_or(&lookup, "PORT", 3000)?;

        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::MissingDatabaseUrl)?;

        let snapshot_path = lookup("SNAPSHOT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("paysync-cache.json"));

        let defaults = SyncConfig::default();
        let sync = SyncConfig {
            auto_sync: parse_or(&lookup, "SYNC_AUTO", defaults.auto_sync)?,
            sync_interval_ms: parse_or(&lookup, "SYNC_INTERVAL_MS", defaults.sync_interval_ms)?,
            max_retries: parse_or(&lookup, "SYNC_MAX_RETRIES", defaults.max_retries)?,
            batch_size: parse_or(&lookup, "SYNC_BATCH_SIZE", defaults.batch_size)?,
            epsilon: parse_or(&lookup, "SYNC_EPSILON", defaults.epsilon)?,
            ..defaults
        };
        sync.validate()
            .map_err(|e| ConfigError::InvalidSync(e.to_string()))?;

        Ok(Self {
            host,
            port,
            database_url,
            snapshot_path,
            sync,
        })
    }

    /// `host:port` for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid {name} value: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Invalid sync settings: {0}")]
    InvalidSync(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_with_database_url() {
        let config = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/paysync")]))
            .unwrap();

        assert_eq!(config.port, 3000);
        assert_eq!(config.bind_addr(), "127.0.0.1:3000");
        assert_eq!(config.snapshot_path, PathBuf::from("paysync-cache.json"));
        assert!(!config.sync.auto_sync);
        assert_eq!(config.sync.sync_interval_ms, 300_000);
    }

    #[test]
    fn database_url_required() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingDatabaseUrl));
    }

    #[test]
    fn sync_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/paysync"),
            ("PORT", "8080"),
            ("SNAPSHOT_PATH", "/var/lib/paysync/cache.json"),
            ("SYNC_AUTO", "true"),
            ("SYNC_INTERVAL_MS", "60000"),
            ("SYNC_MAX_RETRIES", "5"),
            ("SYNC_BATCH_SIZE", "100"),
            ("SYNC_EPSILON", "0.01"),
        ]))
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(
            config.snapshot_path,
            PathBuf::from("/var/lib/paysync/cache.json")
        );
        assert!(config.sync.auto_sync);
        assert_eq!(config.sync.sync_interval_ms, 60_000);
        assert_eq!(config.sync.max_retries, 5);
        assert_eq!(config.sync.batch_size, 100);
        assert_eq!(config.sync.epsilon, 0.01);
    }

    #[test]
    fn invalid_values_are_named() {
        let err = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/paysync"),
            ("PORT", "eighty"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "PORT", .. }));

        let err = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/paysync"),
            ("SYNC_BATCH_SIZE", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSync(_)));
    }
}
