//! Connection pool configuration.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Invalid or missing database configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PostgresConfigError {
    /// A required variable is not set.
    #[error("Missing environment variable {0}")]
    Missing(&'static str),

    /// A variable could not be parsed.
    #[error("Invalid value '{value}' for {key}")]
    Invalid {
        /// Variable name.
        key: &'static str,
        /// Offending value.
        value: String,
    },
}

/// `PostgreSQL` connection settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostgresConfig {
    /// Connection string.
    pub database_url: String,
    /// Pool size ceiling.
    pub max_connections: u32,
    /// How long to wait for a pooled connection.
    pub acquire_timeout: Duration,
}

impl PostgresConfig {
    /// Default pool size.
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
    /// Default acquire timeout in seconds.
    pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 5;

    /// Settings for `database_url` with default pool sizing.
    #[must_use]
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(Self::DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }

    /// Read `DATABASE_URL`, `DATABASE_MAX_CONNECTIONS` and
    /// `DATABASE_ACQUIRE_TIMEOUT_SECS`, loading `.env` first if present.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresConfigError`] if the URL is missing or a number is malformed.
    pub fn from_env() -> Result<Self, PostgresConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresConfigError`] if the URL is missing or a number is malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PostgresConfigError> {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or(PostgresConfigError::Missing("DATABASE_URL"))?;
        let mut config = Self::new(database_url);

        if let Some(value) = lookup("DATABASE_MAX_CONNECTIONS") {
            config.max_connections = value
                .trim()
                .parse()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(PostgresConfigError::Invalid {
                    key: "DATABASE_MAX_CONNECTIONS",
                    value,
                })?;
        }
        if let Some(value) = lookup("DATABASE_ACQUIRE_TIMEOUT_SECS") {
            let secs: u64 = value.trim().parse().map_err(|_| PostgresConfigError::Invalid {
                key: "DATABASE_ACQUIRE_TIMEOUT_SECS",
                value: value.clone(),
            })?;
            config.acquire_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    /// Open a pool with these settings.
    ///
    /// # Errors
    ///
    /// Returns the driver error if no connection can be established.
    pub async fn connect(&self) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect(&self.database_url)
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn url_is_required() {
        assert_eq!(
            PostgresConfig::from_lookup(lookup(&[])).unwrap_err(),
            PostgresConfigError::Missing("DATABASE_URL")
        );
        assert!(PostgresConfig::from_lookup(lookup(&[("DATABASE_URL", "  ")])).is_err());
    }

    #[test]
    fn pool_sizing_is_read() {
        let config = PostgresConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/waybills"),
            ("DATABASE_MAX_CONNECTIONS", "25"),
            ("DATABASE_ACQUIRE_TIMEOUT_SECS", "2"),
        ]))
        .unwrap();
        assert_eq!(config.max_connections, 25);
        assert_eq!(config.acquire_timeout, Duration::from_secs(2));
    }

    #[test]
    fn zero_pool_is_rejected() {
        let err = PostgresConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/waybills"),
            ("DATABASE_MAX_CONNECTIONS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, PostgresConfigError::Invalid { key: "DATABASE_MAX_CONNECTIONS", .. }));
    }
}
