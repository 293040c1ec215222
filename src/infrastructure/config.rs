use crate::infrastructure::logging::LoggingConfig;
use chrono::FixedOffset;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Unset means usage records are kept in process memory.
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub jwt_secret: String,
    pub database: DatabaseConfig,
    pub rate_limit_cleanup_interval: Duration,
    pub usage_store_timeout: Duration,
    pub billing_offset: Option<FixedOffset>,
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            jwt_secret: "dev-secret-change-me".to_string(),
            database: DatabaseConfig::default(),
            rate_limit_cleanup_interval: Duration::from_secs(5 * 60),
            usage_store_timeout: Duration::from_secs(5),
            billing_offset: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key/value source; unset keys keep their
    /// defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let database = DatabaseConfig {
            url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", defaults.database.max_connections)?,
            acquire_timeout: defaults.database.acquire_timeout,
        };

        let billing_offset = match lookup("BILLING_UTC_OFFSET_MINUTES") {
            Some(raw) => {
                let minutes: i32 = parse_value("BILLING_UTC_OFFSET_MINUTES", &raw)?;
                let offset = FixedOffset::east_opt(minutes * 60).ok_or(ConfigError::InvalidValue {
                    key: "BILLING_UTC_OFFSET_MINUTES",
                    value: raw,
                })?;
                Some(offset)
            }
            None => None,
        };

        let logging = LoggingConfig {
            log_dir: lookup("LOG_DIR").unwrap_or(defaults.logging.log_dir),
            log_level: parse_or(&lookup, "LOG_LEVEL", defaults.logging.log_level)?,
            enable_file: parse_or(&lookup, "LOG_TO_FILE", defaults.logging.enable_file)?,
            ..defaults.logging
        };

        Ok(Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "PORT", defaults.port)?,
            jwt_secret: lookup("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            database,
            rate_limit_cleanup_interval: Duration::from_secs(parse_positive_or(
                &lookup,
                "RATE_LIMIT_CLEANUP_INTERVAL_SECS",
                defaults.rate_limit_cleanup_interval.as_secs(),
            )?),
            usage_store_timeout: Duration::from_millis(parse_positive_or(
                &lookup,
                "USAGE_STORE_TIMEOUT_MS",
                defaults.usage_store_timeout.as_millis() as u64,
            )?),
            billing_offset,
            logging,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

/// Like `parse_or`, but zero is rejected.
fn parse_positive_or<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_or(lookup, key, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        });
    }
    Ok(value)
}

fn parse_value<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
    })
}
