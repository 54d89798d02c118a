use crate::{env_duration_secs, env_parse, env_required, ConfigError, FromEnv};
use std::time::Duration;

/// Relational system-of-record settings
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub acquire_timeout: Duration,
    pub sql_logging: bool,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 20,
            min_connections: 2,
            connect_timeout: Duration::from_secs(8),
            acquire_timeout: Duration::from_secs(8),
            sql_logging: false,
        }
    }
}

impl FromEnv for DatabaseConfig {
    /// Requires DATABASE_URL; pool knobs are optional.
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::new(env_required("DATABASE_URL")?);
        Ok(Self {
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", defaults.max_connections)?,
            min_connections: env_parse("DATABASE_MIN_CONNECTIONS", defaults.min_connections)?,
            connect_timeout: env_duration_secs(
                "DATABASE_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout,
            )?,
            acquire_timeout: env_duration_secs(
                "DATABASE_ACQUIRE_TIMEOUT_SECS",
                defaults.acquire_timeout,
            )?,
            sql_logging: env_parse("DATABASE_SQL_LOGGING", defaults.sql_logging)?,
            ..defaults
        })
    }
}
