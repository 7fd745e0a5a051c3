//! Database connection settings.

use std::env;
use std::time::Duration;

/// Connection settings for the ticket store.
///
/// Only the URL is required. Pool sizing defaults suit the
/// single-active-engine deployment model; ad-hoc CLI commands and tests
/// override per caller.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full PostgreSQL connection URL, including the database name.
    pub database_url: String,
    pub max_connections: u32,
    /// Bound on every pool acquisition; this is what keeps DB calls from
    /// blocking the scheduler indefinitely.
    pub acquire_timeout: Duration,
}

impl DbConfig {
    /// Environment variable consulted by [`DbConfig::from_env`].
    pub const ENV_URL: &str = "DROVER_DATABASE_URL";

    /// Fallback URL when neither a flag nor the environment provides one.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/drover";

    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }

    /// Build a config from `DROVER_DATABASE_URL`, falling back to the
    /// default local database.
    pub fn from_env() -> Self {
        match env::var(Self::ENV_URL) {
            Ok(url) => Self::new(url),
            Err(_) => Self::new(Self::DEFAULT_URL),
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_applies_pool_defaults() {
        let cfg = DbConfig::new("postgresql://localhost:5432/mydb");
        assert_eq!(cfg.database_url, "postgresql://localhost:5432/mydb");
        assert_eq!(cfg.max_connections, 5);
        assert_eq!(cfg.acquire_timeout, Duration::from_secs(10));
    }

    #[test]
    fn max_connections_override() {
        let cfg = DbConfig::new(DbConfig::DEFAULT_URL).with_max_connections(1);
        assert_eq!(cfg.max_connections, 1);
    }

    #[test]
    fn default_url_names_the_drover_database() {
        assert!(DbConfig::DEFAULT_URL.ends_with("/drover"));
    }
}
