// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Duragraph control-plane configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Public base URL used when handing protocol URLs to workers
    pub base_url: String,
    /// Heartbeat age after which a worker is no longer considered healthy
    pub worker_liveness: Duration,
    /// Delay between outbox relay passes
    pub relay_interval: Duration,
    /// Maximum outbox rows fetched per relay pass
    pub relay_batch_size: i64,
    /// Published outbox rows older than this many days are deleted
    pub outbox_retention_days: i64,
    /// Default timeout for join/wait operations
    pub join_timeout: Duration,
    /// Maximum connections in the database pool
    pub max_db_connections: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `DURAGRAPH_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `DURAGRAPH_BASE_URL`: (default: http://localhost:8080)
    /// - `DURAGRAPH_WORKER_LIVENESS_SECS`: (default: 30)
    /// - `DURAGRAPH_RELAY_INTERVAL_MS`: (default: 1000)
    /// - `DURAGRAPH_RELAY_BATCH_SIZE`: (default: 10)
    /// - `DURAGRAPH_OUTBOX_RETENTION_DAYS`: (default: 7)
    /// - `DURAGRAPH_JOIN_TIMEOUT_SECS`: (default: 300)
    /// - `DURAGRAPH_MAX_DB_CONNECTIONS`: (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DURAGRAPH_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("DURAGRAPH_DATABASE_URL"))?;

        let base_url = std::env::var("DURAGRAPH_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8080".to_string())
            .trim_end_matches('/')
            .to_string();

        let worker_liveness_secs: u64 = std::env::var("DURAGRAPH_WORKER_LIVENESS_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "DURAGRAPH_WORKER_LIVENESS_SECS",
                    "must be a positive integer",
                )
            })?;
        if worker_liveness_secs == 0 {
            return Err(ConfigError::Invalid(
                "DURAGRAPH_WORKER_LIVENESS_SECS",
                "must be greater than zero",
            ));
        }

        let relay_interval_ms: u64 = std::env::var("DURAGRAPH_RELAY_INTERVAL_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("DURAGRAPH_RELAY_INTERVAL_MS", "must be a positive integer")
            })?;

        let relay_batch_size: i64 = std::env::var("DURAGRAPH_RELAY_BATCH_SIZE")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .ok()
            .filter(|n: &i64| *n > 0)
            .ok_or(ConfigError::Invalid(
                "DURAGRAPH_RELAY_BATCH_SIZE",
                "must be a positive integer",
            ))?;

        let outbox_retention_days: i64 = std::env::var("DURAGRAPH_OUTBOX_RETENTION_DAYS")
            .unwrap_or_else(|_| "7".to_string())
            .parse()
            .ok()
            .filter(|n: &i64| *n >= 0)
            .ok_or(ConfigError::Invalid(
                "DURAGRAPH_OUTBOX_RETENTION_DAYS",
                "must be a non-negative integer",
            ))?;

        let join_timeout_secs: u64 = std::env::var("DURAGRAPH_JOIN_TIMEOUT_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("DURAGRAPH_JOIN_TIMEOUT_SECS", "must be a positive integer")
            })?;

        let max_db_connections: u32 = std::env::var("DURAGRAPH_MAX_DB_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("DURAGRAPH_MAX_DB_CONNECTIONS", "must be a positive integer")
            })?;

        Ok(Self {
            database_url,
            base_url,
            worker_liveness: Duration::from_secs(worker_liveness_secs),
            relay_interval: Duration::from_millis(relay_interval_ms),
            relay_batch_size,
            outbox_retention_days,
            join_timeout: Duration::from_secs(join_timeout_secs),
            max_db_connections,
        })
    }

    /// Whether the database URL points at SQLite.
    pub fn is_sqlite(&self) -> bool {
        self.database_url.starts_with("sqlite:")
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Serializes tests that touch the process environment
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const OPTIONAL_VARS: &[&str] = &[
        "DURAGRAPH_BASE_URL",
        "DURAGRAPH_WORKER_LIVENESS_SECS",
        "DURAGRAPH_RELAY_INTERVAL_MS",
        "DURAGRAPH_RELAY_BATCH_SIZE",
        "DURAGRAPH_OUTBOX_RETENTION_DAYS",
        "DURAGRAPH_JOIN_TIMEOUT_SECS",
        "DURAGRAPH_MAX_DB_CONNECTIONS",
    ];

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }

        fn clear_optional(&mut self) {
            for key in OPTIONAL_VARS {
                self.remove(key);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("DURAGRAPH_DATABASE_URL", "postgres://localhost/test");
        guard.clear_optional();

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/test");
        assert_eq!(config.base_url, "http://localhost:8080");
        assert_eq!(config.worker_liveness, Duration::from_secs(30));
        assert_eq!(config.relay_interval, Duration::from_millis(1000));
        assert_eq!(config.relay_batch_size, 10);
        assert_eq!(config.outbox_retention_days, 7);
        assert_eq!(config.join_timeout, Duration::from_secs(300));
        assert_eq!(config.max_db_connections, 10);
        assert!(!config.is_sqlite());
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("DURAGRAPH_DATABASE_URL", "sqlite:data/duragraph.db");
        guard.set("DURAGRAPH_BASE_URL", "https://cp.example.com/");
        guard.set("DURAGRAPH_WORKER_LIVENESS_SECS", "90");
        guard.set("DURAGRAPH_RELAY_INTERVAL_MS", "250");
        guard.set("DURAGRAPH_RELAY_BATCH_SIZE", "50");
        guard.set("DURAGRAPH_OUTBOX_RETENTION_DAYS", "1");
        guard.set("DURAGRAPH_JOIN_TIMEOUT_SECS", "60");
        guard.set("DURAGRAPH_MAX_DB_CONNECTIONS", "4");

        let config = Config::from_env().unwrap();

        assert!(config.is_sqlite());
        assert_eq!(config.base_url, "https://cp.example.com");
        assert_eq!(config.worker_liveness, Duration::from_secs(90));
        assert_eq!(config.relay_interval, Duration::from_millis(250));
        assert_eq!(config.relay_batch_size, 50);
        assert_eq!(config.outbox_retention_days, 1);
        assert_eq!(config.join_timeout, Duration::from_secs(60));
        assert_eq!(config.max_db_connections, 4);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("DURAGRAPH_DATABASE_URL");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DURAGRAPH_DATABASE_URL")));
        assert!(err.to_string().contains("DURAGRAPH_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_values() {
        let _lock = ENV_MUTEX.lock().unwrap();

        let cases = [
            ("DURAGRAPH_WORKER_LIVENESS_SECS", "soon"),
            ("DURAGRAPH_WORKER_LIVENESS_SECS", "0"),
            ("DURAGRAPH_RELAY_INTERVAL_MS", "-5"),
            ("DURAGRAPH_RELAY_BATCH_SIZE", "0"),
            ("DURAGRAPH_OUTBOX_RETENTION_DAYS", "-1"),
            ("DURAGRAPH_JOIN_TIMEOUT_SECS", "forever"),
            ("DURAGRAPH_MAX_DB_CONNECTIONS", "many"),
        ];

        for (key, value) in cases {
            let mut guard = EnvGuard::new();
            guard.set("DURAGRAPH_DATABASE_URL", "postgres://localhost/test");
            guard.clear_optional();
            guard.set(key, value);

            match Config::from_env() {
                Err(ConfigError::Invalid(name, _)) => assert_eq!(name, key),
                other => panic!("expected Invalid for {key}={value}, got {other:?}"),
            }
        }
    }
}
