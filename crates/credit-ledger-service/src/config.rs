//! Service configuration.
//!
//! Secrets are read from `.secrets/ledger.json` when present, falling back to
//! environment variables. Everything else comes from the environment.
//! [`ServiceConfig::validate`] runs once at startup; the service refuses to
//! start with a configuration that fails it.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use credit_ledger_core::GrantPeriod;

/// Minimum length of the admin code.
pub const MIN_ADMIN_CODE_LEN: usize = 16;

/// Configuration errors reported at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required setting is absent.
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    /// A setting has an unusable value.
    #[error("invalid value for {key}: {message}")]
    Invalid {
        /// The offending setting.
        key: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

/// Which storage backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// In-process maps. Single instance only; state is lost on restart.
    #[default]
    Memory,
    /// PostgreSQL via `DATABASE_URL`.
    Postgres,
    /// Embedded `RocksDB` under `DATA_DIR`.
    Rocksdb,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "rocksdb" => Ok(Self::Rocksdb),
            other => Err(format!("unknown store backend: {other}")),
        }
    }
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// Storage backend (default: memory).
    pub store_backend: StoreBackend,

    /// PostgreSQL connection string, required for the postgres backend.
    pub database_url: Option<String>,

    /// Path to the `RocksDB` data directory (default: "/data/credit-ledger").
    pub data_dir: String,

    /// Service API key for service-to-service auth.
    pub service_api_key: Option<String>,

    /// Shared admin code for the admin endpoints.
    pub admin_code: Option<String>,

    /// Billing webhook signing secret (optional).
    pub webhook_secret: Option<String>,

    /// Grant period for subscription credits (default: monthly).
    pub grant_period: GrantPeriod,

    /// JSON plan catalog used to seed an empty store (optional).
    pub plan_catalog_path: Option<String>,

    /// Upper bound on a single store round-trip, in milliseconds.
    pub store_timeout_ms: u64,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,

    /// Maximum in-flight requests on the `/v1` routes.
    pub max_concurrent_requests: usize,
}

/// Secrets file structure.
#[derive(Debug, Default, Deserialize)]
struct LedgerSecrets {
    #[serde(default)]
    service_api_key: Option<String>,
    #[serde(default)]
    admin_code: Option<String>,
    #[serde(default)]
    webhook_secret: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
}

impl ServiceConfig {
    /// Load configuration from environment variables and the secrets file.
    ///
    /// # Errors
    ///
    /// Returns an error if a setting is present but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let secrets = load_ledger_secrets();
        let defaults = Self::default();

        Ok(Self {
            listen_addr: env_var("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            store_backend: parse_env("STORE_BACKEND")?.unwrap_or_default(),
            database_url: secrets.database_url.or_else(|| env_var("DATABASE_URL")),
            data_dir: env_var("DATA_DIR").unwrap_or(defaults.data_dir),
            service_api_key: secrets
                .service_api_key
                .or_else(|| env_var("SERVICE_API_KEY")),
            admin_code: secrets.admin_code.or_else(|| env_var("ADMIN_CODE")),
            webhook_secret: secrets.webhook_secret.or_else(|| env_var("WEBHOOK_SECRET")),
            grant_period: parse_env("GRANT_PERIOD")?.unwrap_or_default(),
            plan_catalog_path: env_var("PLAN_CATALOG_PATH"),
            store_timeout_ms: parse_env("STORE_TIMEOUT_MS")?
                .unwrap_or(defaults.store_timeout_ms),
            cors_origins: env_var("CORS_ORIGINS").map_or(defaults.cors_origins, |origins| {
                origins.split(',').map(|s| s.trim().to_string()).collect()
            }),
            max_body_bytes: parse_env("MAX_BODY_BYTES")?.unwrap_or(defaults.max_body_bytes),
            request_timeout_seconds: parse_env("REQUEST_TIMEOUT_SECONDS")?
                .unwrap_or(defaults.request_timeout_seconds),
            max_concurrent_requests: parse_env("MAX_CONCURRENT_REQUESTS")?
                .unwrap_or(defaults.max_concurrent_requests),
        })
    }

    /// Check that the configuration is complete and usable.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.service_api_key.as_deref() {
            None | Some("") => return Err(ConfigError::Missing("SERVICE_API_KEY")),
            Some(_) => {}
        }

        let admin_code = self
            .admin_code
            .as_deref()
            .ok_or(ConfigError::Missing("ADMIN_CODE"))?;
        if admin_code.len() < MIN_ADMIN_CODE_LEN {
            return Err(ConfigError::Invalid {
                key: "ADMIN_CODE",
                message: format!("must be at least {MIN_ADMIN_CODE_LEN} characters"),
            });
        }

        match self.store_backend {
            StoreBackend::Postgres if self.database_url.is_none() => {
                return Err(ConfigError::Missing("DATABASE_URL"));
            }
            StoreBackend::Rocksdb if !cfg!(feature = "rocksdb-backend") => {
                return Err(ConfigError::Invalid {
                    key: "STORE_BACKEND",
                    message: "built without the rocksdb-backend feature".into(),
                });
            }
            _ => {}
        }

        if self.store_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "STORE_TIMEOUT_MS",
                message: "must be greater than zero".into(),
            });
        }
        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_CONCURRENT_REQUESTS",
                message: "must be greater than zero".into(),
            });
        }

        Ok(())
    }

    /// Upper bound on a single store round-trip.
    #[must_use]
    pub const fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_env<T>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_var(key)
        .map(|raw| {
            raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                message: e.to_string(),
            })
        })
        .transpose()
}

/// Load ledger secrets from file, if one exists.
fn load_ledger_secrets() -> LedgerSecrets {
    let secret_paths = [".secrets/ledger.json", "../.secrets/ledger.json"];

    for path in &secret_paths {
        match load_secrets_file::<LedgerSecrets>(path) {
            Ok(secrets) => {
                tracing::info!(path = %path, "Loaded ledger secrets from file");
                return secrets;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path, error = %e, "Ignoring unreadable secrets file"),
        }
    }

    tracing::debug!("Ledger secrets file not found, using environment variables");
    LedgerSecrets::default()
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            store_backend: StoreBackend::Memory,
            database_url: None,
            data_dir: "/data/credit-ledger".into(),
            service_api_key: None,
            admin_code: None,
            webhook_secret: None,
            grant_period: GrantPeriod::Monthly,
            plan_catalog_path: None,
            store_timeout_ms: 3_000,
            cors_origins: vec!["*".into()],
            max_body_bytes: 64 * 1024,
            request_timeout_seconds: 30,
            max_concurrent_requests: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ServiceConfig {
        ServiceConfig {
            service_api_key: Some("service-key".into()),
            admin_code: Some("0123456789abcdef".into()),
            ..ServiceConfig::default()
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn service_key_is_required() {
        let config = ServiceConfig {
            service_api_key: None,
            ..valid()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("SERVICE_API_KEY"))
        ));
    }

    #[test]
    fn short_admin_code_is_rejected() {
        let config = ServiceConfig {
            admin_code: Some("1234".into()),
            ..valid()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "ADMIN_CODE", .. })
        ));
    }

    #[test]
    fn postgres_needs_database_url() {
        let config = ServiceConfig {
            store_backend: StoreBackend::Postgres,
            ..valid()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));
    }

    #[test]
    fn store_backend_parses_case_insensitively() {
        assert_eq!("Postgres".parse::<StoreBackend>(), Ok(StoreBackend::Postgres));
        assert_eq!("memory".parse::<StoreBackend>(), Ok(StoreBackend::Memory));
        assert!("mysql".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = ServiceConfig {
            store_timeout_ms: 0,
            ..valid()
        };
        assert!(config.validate().is_err());
    }
}
