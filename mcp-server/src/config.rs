use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitSettings,
    pub context_cache: ContextCacheSettings,
    pub token_cache: TokenCacheSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    /// Optional database URL; defaults to `taskloom.sqlite` in the data dir.
    pub url: Option<String>,
    pub max_connections: u32,
    pub connection_timeout: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub port: u16,
    pub workers: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AuthConfig {
    /// When false, anonymous access is permitted. Testing only.
    pub required: bool,
    /// Must stay false in production; gates the anonymous fallback user.
    pub default_user_allowed: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RateLimitSettings {
    pub per_minute: u32,
    pub burst: u32,
    pub per_hour: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ContextCacheSettings {
    pub ttl_hours: i64,
    pub pressure_threshold: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TokenCacheSettings {
    pub ttl_seconds: u64,
}

impl Config {
    /// Load configuration: built-in defaults, then an optional file, then
    /// `TASKLOOM_`-prefixed environment overrides, then the standard env
    /// names recognised by deployments.
    pub fn from_env() -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        builder = builder.add_source(File::from_str(
            include_str!("../config/default.toml"),
            FileFormat::Toml,
        ));

        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(
                File::with_name(&config_file)
                    .required(false)
                    .format(FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKLOOM")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;
        let mut result: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Self::apply_standard_env_vars(&mut result);
        Ok(result)
    }

    /// Load configuration from a specific file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let builder = ConfigBuilder::builder()
            .add_source(File::from_str(
                include_str!("../config/default.toml"),
                FileFormat::Toml,
            ))
            .add_source(File::with_name(path).format(FileFormat::Toml))
            .add_source(
                Environment::with_prefix("TASKLOOM")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder
            .build()
            .context("Failed to build configuration from file")?;
        let mut result: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration from file")?;
        Self::apply_standard_env_vars(&mut result);
        Ok(result)
    }

    /// The standard environment names and their effects.
    fn apply_standard_env_vars(config: &mut Config) {
        if let Ok(database_url) = env::var("DATABASE_URL") {
            config.database.url = Some(database_url);
        }
        if let Ok(listen_addr) = env::var("LISTEN_ADDR") {
            config.server.listen_addr = listen_addr;
        }
        if let Ok(log_level) = env::var("LOG_LEVEL") {
            config.logging.level = log_level;
        }
        if let Some(v) = parse_env::<u32>("RATE_LIMIT_PER_MINUTE") {
            config.rate_limit.per_minute = v;
        }
        if let Some(v) = parse_env::<u32>("RATE_LIMIT_BURST") {
            config.rate_limit.burst = v;
        }
        if let Some(v) = parse_env::<u32>("RATE_LIMIT_PER_HOUR") {
            config.rate_limit.per_hour = v;
        }
        if let Some(v) = parse_env::<i64>("CONTEXT_CACHE_TTL_HOURS") {
            config.context_cache.ttl_hours = v;
        }
        if let Some(v) = parse_env::<u64>("CONTEXT_CACHE_PRESSURE_THRESHOLD") {
            config.context_cache.pressure_threshold = v;
        }
        if let Some(v) = parse_env::<u64>("TOKEN_CACHE_TTL_SECONDS") {
            config.token_cache.ttl_seconds = v;
        }
        if let Some(v) = parse_env::<bool>("AUTH_REQUIRED") {
            config.auth.required = v;
        }
        if let Some(v) = parse_env::<bool>("DEFAULT_USER_ID_ALLOWED") {
            config.auth.default_user_allowed = v;
        }
    }

    /// The database URL with a data-directory fallback.
    pub fn database_url(&self) -> String {
        match &self.database.url {
            Some(url) => url.clone(),
            None => Self::default_database_url(),
        }
    }

    pub fn default_database_url() -> String {
        if let Ok(xdg_data) = env::var("XDG_DATA_HOME") {
            return format!("sqlite://{xdg_data}/taskloom/taskloom.sqlite");
        }
        let home = env::var("HOME")
            .or_else(|_| env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        format!("sqlite://{home}/taskloom.sqlite")
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.listen_addr, self.server.port)
    }

    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(anyhow::anyhow!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                ));
            }
        }

        let database_url = self.database_url();
        if !database_url.starts_with("sqlite://") && !database_url.starts_with(":memory:") {
            return Err(anyhow::anyhow!(
                "Only SQLite databases are supported. URL must start with 'sqlite://'. Got: {database_url}"
            ));
        }

        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }
        if self.rate_limit.per_minute == 0 || self.rate_limit.per_hour == 0 {
            return Err(anyhow::anyhow!("Rate limits must be greater than 0"));
        }
        if self.context_cache.ttl_hours <= 0 {
            return Err(anyhow::anyhow!("CONTEXT_CACHE_TTL_HOURS must be positive"));
        }

        // Disabling auth without explicitly allowing the fallback user is
        // a misconfiguration, not a default anyone should reach.
        if !self.auth.required && !self.auth.default_user_allowed {
            return Err(anyhow::anyhow!(
                "AUTH_REQUIRED=false also requires DEFAULT_USER_ID_ALLOWED=true (testing only)"
            ));
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|raw| raw.parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: None,
                max_connections: 5,
                connection_timeout: 30,
            },
            server: ServerConfig {
                listen_addr: "127.0.0.1".to_string(),
                port: 3000,
                workers: 4,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Pretty,
            },
            auth: AuthConfig {
                required: true,
                default_user_allowed: false,
            },
            rate_limit: RateLimitSettings {
                per_minute: 100,
                burst: 20,
                per_hour: 1000,
            },
            context_cache: ContextCacheSettings {
                ttl_hours: 1,
                pressure_threshold: 500,
            },
            token_cache: TokenCacheSettings { ttl_seconds: 300 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.rate_limit.per_minute, 100);
        assert_eq!(config.rate_limit.burst, 20);
        assert_eq!(config.rate_limit.per_hour, 1000);
        assert_eq!(config.context_cache.ttl_hours, 1);
        assert_eq!(config.token_cache.ttl_seconds, 300);
        assert!(config.auth.required);
        assert!(!config.auth.default_user_allowed);
    }

    #[test]
    fn test_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());

        let mut invalid = Config::default();
        invalid.logging.level = "shouting".to_string();
        assert!(invalid.validate().is_err());

        let mut invalid = Config::default();
        invalid.rate_limit.per_minute = 0;
        assert!(invalid.validate().is_err());

        // Auth off requires the explicit default-user opt-in
        let mut testing = Config::default();
        testing.auth.required = false;
        assert!(testing.validate().is_err());
        testing.auth.default_user_allowed = true;
        assert!(testing.validate().is_ok());
    }

    #[test]
    fn test_standard_env_overrides() {
        env::set_var("RATE_LIMIT_PER_MINUTE", "42");
        env::set_var("CONTEXT_CACHE_TTL_HOURS", "2");
        let mut config = Config::default();
        Config::apply_standard_env_vars(&mut config);
        assert_eq!(config.rate_limit.per_minute, 42);
        assert_eq!(config.context_cache.ttl_hours, 2);
        env::remove_var("RATE_LIMIT_PER_MINUTE");
        env::remove_var("CONTEXT_CACHE_TTL_HOURS");
    }

    #[test]
    fn test_database_url_fallback() {
        let config = Config::default();
        assert!(config.database_url().starts_with("sqlite://"));

        let mut config = Config::default();
        config.database.url = Some("sqlite://custom.db".to_string());
        assert_eq!(config.database_url(), "sqlite://custom.db");
    }
}
