//! Orchestrator configuration.
//!
//! Settings are read from `config/launchguard.toml` (optional) and then overridden by
//! environment variables prefixed with `LAUNCHGUARD`, e.g.
//! `LAUNCHGUARD__MIGRATIONS__ENABLED=false` or `LAUNCHGUARD__MIGRATIONS__DATABASE__HOST=db`.

use crate::connection::ConnectionSettings;
use config::{Config, ConfigError, Environment, File};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the optional configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "config/launchguard.toml";

/// Largest accepted timeout: `statement_timeout` is an `i32` of milliseconds.
pub const MAX_TIMEOUT_SECONDS: u64 = i32::MAX as u64 / 1000;

static TABLE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("valid table name regex")
});

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    /// Master switch. When `false` the orchestrator makes no database calls at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Reported to PostgreSQL as `application_name`; also seeds the derived lock key.
    #[serde(default = "default_application_name")]
    pub application_name: String,
    /// Selects the seed script subset (`<seeds_location>/<environment>`).
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Advisory lock key shared by every replica of the service.
    #[serde(default)]
    pub lock_key: Option<i64>,
    #[serde(default = "default_lock_max_wait_seconds")]
    pub lock_max_wait_seconds: u64,
    #[serde(default = "default_lock_poll_interval_seconds")]
    pub lock_poll_interval_seconds: u64,
    #[serde(default = "default_execution_timeout_seconds")]
    pub execution_timeout_seconds: u64,
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,
    #[serde(default = "default_migrations_location")]
    pub migrations_location: String,
    #[serde(default = "default_seeds_location")]
    pub seeds_location: String,
    #[serde(default = "default_ledger_table")]
    pub ledger_table: String,
    /// Values for `$name$` tokens in migration scripts.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub database: ConnectionSettings,
}

fn default_enabled() -> bool {
    true
}

fn default_application_name() -> String {
    "launchguard".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_lock_max_wait_seconds() -> u64 {
    60
}

fn default_lock_poll_interval_seconds() -> u64 {
    5
}

fn default_execution_timeout_seconds() -> u64 {
    300
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("db")
}

fn default_migrations_location() -> String {
    "migrations".to_string()
}

fn default_seeds_location() -> String {
    "seeds".to_string()
}

fn default_ledger_table() -> String {
    "schema_versions".to_string()
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            application_name: default_application_name(),
            environment: default_environment(),
            lock_key: None,
            lock_max_wait_seconds: default_lock_max_wait_seconds(),
            lock_poll_interval_seconds: default_lock_poll_interval_seconds(),
            execution_timeout_seconds: default_execution_timeout_seconds(),
            scripts_dir: default_scripts_dir(),
            migrations_location: default_migrations_location(),
            seeds_location: default_seeds_location(),
            ledger_table: default_ledger_table(),
            variables: BTreeMap::new(),
            database: ConnectionSettings::default(),
        }
    }
}

impl MigrationConfig {
    /// Load from [`DEFAULT_CONFIG_FILE`], falling back to env vars.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from the given TOML file (optional) layered under `LAUNCHGUARD__*` env vars.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file_source = File::from(path).required(false);

        let settings = match Config::builder()
            .add_source(file_source)
            .add_source(env_source())
            .build()
        {
            Ok(cfg) => cfg,
            Err(err) => {
                // Unreadable file: keep booting from the environment alone.
                if path.exists() {
                    log::warn!(
                        "failed to load {}, falling back to environment: {}",
                        path.display(),
                        err
                    );
                }
                Config::builder().add_source(env_source()).build().map_err(|env_err| {
                    ConfigError::Message(format!(
                        "Failed to load configuration from file and env: {}, then env-only error: {}",
                        err, env_err
                    ))
                })?
            }
        };

        // A missing `migrations` section means "all defaults".
        let config = match settings.get::<MigrationConfig>("migrations") {
            Ok(config) => config,
            Err(ConfigError::NotFound(_)) => MigrationConfig::default(),
            Err(e) => {
                return Err(ConfigError::Message(format!(
                    "Migration configuration could not be loaded from file or environment: {}",
                    e
                )))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would be interpolated into SQL or paths unsafely, and timeouts
    /// that would make every boot fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !TABLE_NAME.is_match(&self.ledger_table) {
            return Err(ConfigError::Message(format!(
                "ledger_table '{}' is not a valid SQL identifier",
                self.ledger_table
            )));
        }
        for (name, value) in [
            ("lock_max_wait_seconds", self.lock_max_wait_seconds),
            ("lock_poll_interval_seconds", self.lock_poll_interval_seconds),
            ("execution_timeout_seconds", self.execution_timeout_seconds),
        ] {
            if value == 0 {
                return Err(ConfigError::Message(format!("{} must be greater than zero", name)));
            }
            if value > MAX_TIMEOUT_SECONDS {
                return Err(ConfigError::Message(format!(
                    "{} must be at most {} (PostgreSQL statement_timeout limit)",
                    name, MAX_TIMEOUT_SECONDS
                )));
            }
        }
        Ok(())
    }

    /// The configured lock key, or one derived from `application_name`.
    pub fn resolved_lock_key(&self) -> i64 {
        self.lock_key
            .unwrap_or_else(|| crate::lock::derive_lock_key(&self.application_name))
    }

    pub fn lock_max_wait(&self) -> Duration {
        Duration::from_secs(self.lock_max_wait_seconds)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_secs(self.lock_poll_interval_seconds)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_seconds)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix("LAUNCHGUARD").separator("__")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = MigrationConfig::default();
        assert!(config.enabled);
        assert_eq!(config.lock_max_wait(), Duration::from_secs(60));
        assert_eq!(config.lock_poll_interval(), Duration::from_secs(5));
        assert_eq!(config.ledger_table, "schema_versions");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[migrations]
enabled = false
application_name = "catalog-api"
environment = "staging"
lock_key = 4242
ledger_table = "ops.schema_versions"

[migrations.variables]
owner = "catalog"

[migrations.database]
host = "db.internal"
name = "catalog"
user = "catalog"
password = "secret"
"#
        )
        .unwrap();

        let config = MigrationConfig::load_from(file.path()).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.application_name, "catalog-api");
        assert_eq!(config.environment, "staging");
        assert_eq!(config.resolved_lock_key(), 4242);
        assert_eq!(config.variables.get("owner").map(String::as_str), Some("catalog"));
        assert_eq!(config.database.host.as_deref(), Some("db.internal"));
        assert_eq!(config.database.port, 5432);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = MigrationConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.migrations_location, "migrations");
    }

    #[test]
    fn test_rejects_unsafe_ledger_table() {
        let config = MigrationConfig {
            ledger_table: "versions; DROP TABLE users".to_string(),
            ..MigrationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_timeouts() {
        for config in [
            MigrationConfig {
                lock_max_wait_seconds: 0,
                ..MigrationConfig::default()
            },
            MigrationConfig {
                lock_poll_interval_seconds: 0,
                ..MigrationConfig::default()
            },
            MigrationConfig {
                execution_timeout_seconds: 0,
                ..MigrationConfig::default()
            },
        ] {
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("greater than zero"), "{}", err);
        }
    }

    #[test]
    fn test_rejects_timeouts_beyond_statement_timeout_range() {
        let config = MigrationConfig {
            execution_timeout_seconds: u64::MAX,
            ..MigrationConfig::default()
        };
        assert!(config.validate().is_err());

        let config = MigrationConfig {
            execution_timeout_seconds: MAX_TIMEOUT_SECONDS,
            ..MigrationConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_rejects_zero_execution_timeout() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[migrations]\nexecution_timeout_seconds = 0").unwrap();

        assert!(MigrationConfig::load_from(file.path()).is_err());
    }

    #[test]
    fn test_derived_lock_key_is_stable() {
        let config = MigrationConfig {
            application_name: "orders".to_string(),
            ..MigrationConfig::default()
        };
        assert_eq!(config.resolved_lock_key(), config.resolved_lock_key());
        assert_eq!(config.resolved_lock_key(), crate::lock::derive_lock_key("orders"));
    }
}
