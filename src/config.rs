//! Configuration system for Keywarden.
//!
//! Configuration is loaded from multiple sources with the following precedence:
//! 1. Environment variables (highest priority)
//! 2. `config.toml` file
//! 3. Default values (lowest priority)
//!
//! # Environment Variables
//!
//! - `KEYWARDEN_SERVER_HOST` - Server bind address
//! - `KEYWARDEN_SERVER_PORT` - Server port
//! - `KEYWARDEN_DATABASE_TYPE` - "sqlite" or "postgres"
//! - `KEYWARDEN_DATABASE_URL` - Database connection URL
//! - `KEYWARDEN_LOG_LEVEL` - Log level (trace, debug, info, warn, error)
//! - `KEYWARDEN_ADMIN_PASSWORD` - Operator login password
//! - `KEYWARDEN_JWT_SECRET` - Token signing secret
//! - `KEYWARDEN_JWT_ISSUER` - Token issuer claim
//! - `KEYWARDEN_JWT_AUDIENCE` - Token audience claim
//! - `KEYWARDEN_ADMIN_SESSION_SECS` - Operator session lifetime
//! - `KEYWARDEN_DEVICE_TOKEN_SECS` - Device token lifetime

use config::Config;
use serde::Deserialize;
use std::env;
use std::sync::OnceLock;

use crate::errors::{ServiceError, ServiceResult};

/// Global configuration singleton.
static CONFIG: OnceLock<KeywardenConfig> = OnceLock::new();

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KeywardenConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Operator and token configuration
    pub auth: AuthConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database type: "sqlite" or "postgres"
    pub db_type: String,
    /// SQLite connection URL
    pub sqlite_url: String,
    /// PostgreSQL connection URL
    pub postgres_url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_type: "sqlite".to_string(),
            sqlite_url: "sqlite://keywarden.db".to_string(),
            postgres_url: "postgres://localhost/keywarden".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Operator credential and token configuration.
///
/// There is a single shared operator credential; it must be injected via
/// `config.toml` or `KEYWARDEN_ADMIN_PASSWORD` before the server will
/// accept logins. The JWT secret supports `env:VAR_NAME` indirection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Operator login password
    pub admin_password: String,
    /// Token signing secret (use `env:VAR_NAME` to read from environment)
    pub jwt_secret: String,
    /// Token issuer claim (iss)
    pub jwt_issuer: String,
    /// Token audience claim (aud)
    pub jwt_audience: String,
    /// Operator session lifetime in seconds (default: 24 hours)
    pub admin_session_secs: u64,
    /// Device token lifetime in seconds (default: 12 hours)
    pub device_token_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_password: String::new(),
            jwt_secret: String::new(),
            jwt_issuer: "keywarden".to_string(),
            jwt_audience: "keywarden-api".to_string(),
            admin_session_secs: 24 * 3600,
            device_token_secs: 12 * 3600,
        }
    }
}

impl KeywardenConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. `config.toml` file (optional)
    /// 3. Environment variables
    fn load() -> ServiceResult<Self> {
        let builder = Config::builder()
            // Start with defaults
            .set_default("server.host", "127.0.0.1")
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_default("server.port", 8080)
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_default("database.db_type", "sqlite")
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_default("database.sqlite_url", "sqlite://keywarden.db")
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_default("database.postgres_url", "postgres://localhost/keywarden")
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_default("logging.level", "info")
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_default("auth.admin_password", "")
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_default("auth.jwt_secret", "")
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_default("auth.jwt_issuer", "keywarden")
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_default("auth.jwt_audience", "keywarden-api")
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_default("auth.admin_session_secs", 24 * 3600)
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_default("auth.device_token_secs", 12 * 3600)
            .map_err(|e| ServiceError::Config(e.to_string()))?
            // Load from config.toml (optional)
            .add_source(config::File::with_name("config").required(false))
            // Override with environment variables
            .set_override_option("server.host", env::var("KEYWARDEN_SERVER_HOST").ok())
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_override_option(
                "server.port",
                env::var("KEYWARDEN_SERVER_PORT")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok()),
            )
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_override_option("database.db_type", env::var("KEYWARDEN_DATABASE_TYPE").ok())
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_override_option(
                "database.sqlite_url",
                env::var("KEYWARDEN_DATABASE_URL")
                    .ok()
                    .filter(|url| url.starts_with("sqlite")),
            )
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_override_option(
                "database.postgres_url",
                env::var("KEYWARDEN_DATABASE_URL")
                    .ok()
                    .filter(|url| url.starts_with("postgres")),
            )
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_override_option("logging.level", env::var("KEYWARDEN_LOG_LEVEL").ok())
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_override_option(
                "auth.admin_password",
                env::var("KEYWARDEN_ADMIN_PASSWORD").ok(),
            )
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_override_option("auth.jwt_secret", env::var("KEYWARDEN_JWT_SECRET").ok())
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_override_option("auth.jwt_issuer", env::var("KEYWARDEN_JWT_ISSUER").ok())
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_override_option("auth.jwt_audience", env::var("KEYWARDEN_JWT_AUDIENCE").ok())
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_override_option(
                "auth.admin_session_secs",
                env::var("KEYWARDEN_ADMIN_SESSION_SECS")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok()),
            )
            .map_err(|e| ServiceError::Config(e.to_string()))?
            .set_override_option(
                "auth.device_token_secs",
                env::var("KEYWARDEN_DEVICE_TOKEN_SECS")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok()),
            )
            .map_err(|e| ServiceError::Config(e.to_string()))?;

        let settings = builder
            .build()
            .map_err(|e| ServiceError::Config(format!("failed to build config: {e}")))?;

        settings
            .try_deserialize()
            .map_err(|e| ServiceError::Config(format!("failed to deserialize config: {e}")))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ServiceResult<()> {
        if self.server.port == 0 {
            return Err(ServiceError::Config(
                "server.port must be greater than 0".to_string(),
            ));
        }

        match self.database.db_type.as_str() {
            "sqlite" | "postgres" => {}
            other => {
                return Err(ServiceError::Config(format!(
                    "database.db_type must be 'sqlite' or 'postgres', got '{other}'"
                )));
            }
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ServiceError::Config(format!(
                    "logging.level must be one of: trace, debug, info, warn, error. Got '{other}'"
                )));
            }
        }

        if self.auth.admin_session_secs == 0 || self.auth.device_token_secs == 0 {
            return Err(ServiceError::Config(
                "token lifetimes must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Get the global configuration.
///
/// This loads the configuration on first access and caches it for the
/// lifetime of the process; changes require a restart.
pub fn get_config() -> ServiceResult<&'static KeywardenConfig> {
    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }

    let config = KeywardenConfig::load()?;
    config.validate()?;

    // Another thread may have set it in the meantime; first write wins.
    let _ = CONFIG.set(config);

    Ok(CONFIG.get().expect("config was just set"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn defaults_are_sane() {
        let config = KeywardenConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.database.db_type, "sqlite");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.auth.admin_session_secs, 86400);
        assert_eq!(config.auth.device_token_secs, 43200);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn env_overrides_take_precedence() {
        env::set_var("KEYWARDEN_SERVER_PORT", "9099");
        env::set_var("KEYWARDEN_LOG_LEVEL", "debug");

        let config = KeywardenConfig::load().unwrap();
        assert_eq!(config.server.port, 9099);
        assert_eq!(config.logging.level, "debug");

        env::remove_var("KEYWARDEN_SERVER_PORT");
        env::remove_var("KEYWARDEN_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn database_url_routes_by_scheme() {
        env::set_var("KEYWARDEN_DATABASE_URL", "sqlite::memory:");
        let config = KeywardenConfig::load().unwrap();
        assert_eq!(config.database.sqlite_url, "sqlite::memory:");
        // Postgres URL untouched by a sqlite-scheme override
        assert_eq!(config.database.postgres_url, "postgres://localhost/keywarden");
        env::remove_var("KEYWARDEN_DATABASE_URL");
    }

    #[test]
    #[serial]
    fn rejects_bad_log_level() {
        let config = KeywardenConfig {
            logging: LoggingConfig {
                level: "verbose".to_string(),
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn rejects_unknown_db_type() {
        let config = KeywardenConfig {
            database: DatabaseConfig {
                db_type: "mysql".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn rejects_zero_port() {
        let config = KeywardenConfig {
            server: ServerConfig {
                port: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
