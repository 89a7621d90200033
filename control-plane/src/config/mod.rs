use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

use crate::utils::{parse_duration, PasswordPolicy};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub database: DatabaseConfig,
    /// Shared limiter backend; limits stay in-process without it.
    pub redis: Option<RedisConfig>,
    /// Outbound mail; users receive one-time passwords without it.
    pub smtp: Option<SmtpConfig>,
    pub session: SessionConfig,
    pub signup: SignupConfig,
    pub api: ApiConfig,
    pub oidc: OidcConfig,
    pub rate_limit: RateLimitConfig,
    pub password_policy: PasswordPolicy,
    pub bcrypt_cost: u32,
    pub key_provider: KeyProviderConfig,
    pub scheduler: SchedulerConfig,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// A `postgres://` URL, or `memory` for the in-process store.
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.url == "memory"
    }
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
    pub from_name: String,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub duration: Duration,
    pub inactivity_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SignupConfig {
    pub enabled: bool,
    /// Organizations live on `<subdomain>.<base_domain>`.
    pub base_domain: String,
    pub default_org_name: String,
    pub default_org_domain: String,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub request_timeout: Duration,
    pub blocking_request_timeout: Duration,
    /// How long a credential list or create call waits for changes.
    pub broker_wait: Duration,
}

#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub http_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Per organization; zero disables the limit.
    pub org_requests_per_minute: u32,
    pub login_attempts_per_minute: u32,
    /// Failed password logins before the account is locked.
    pub lockout_threshold: u32,
    pub lockout_duration: Duration,
    pub signup_per_ip_per_hour: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum KeyProviderConfig {
    /// Base64 AES-256 key in the named environment variable.
    Env { variable: String },
    /// Base64 AES-256 key file, created on first start when missing.
    File { path: String },
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub device_flow_purge_interval: Duration,
    pub access_key_purge_interval: Duration,
    pub password_reset_purge_interval: Duration,
    pub destination_credential_purge_interval: Duration,
}

impl SchedulerConfig {
    fn intervals(&self) -> [(&'static str, Duration); 4] {
        [
            ("PURGE_DEVICE_FLOW_INTERVAL", self.device_flow_purge_interval),
            ("PURGE_ACCESS_KEYS_INTERVAL", self.access_key_purge_interval),
            ("PURGE_PASSWORD_RESET_INTERVAL", self.password_reset_purge_interval),
            (
                "PURGE_DESTINATION_CREDENTIALS_INTERVAL",
                self.destination_credential_purge_interval,
            ),
        ]
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let redis = optional_env("REDIS_URL").map(|url| RedisConfig { url });
        let smtp = match optional_env("SMTP_HOST") {
            Some(host) => Some(SmtpConfig {
                host,
                port: parse_env("SMTP_PORT", "587", is_prod)?,
                username: get_env("SMTP_USERNAME", Some(""), false)?,
                password: get_env("SMTP_PASSWORD", Some(""), false)?,
                from_address: get_env("SMTP_FROM_ADDRESS", Some("noreply@infrahq.com"), false)?,
                from_name: get_env("SMTP_FROM_NAME", Some("Infra"), false)?,
            }),
            None => None,
        };

        let key_provider = match get_env("KEY_PROVIDER", Some("file"), false)?.as_str() {
            "env" => KeyProviderConfig::Env {
                variable: get_env("ROOT_KEY_ENV", Some("ROOT_KEY"), false)?,
            },
            "file" => KeyProviderConfig::File {
                path: get_env("ROOT_KEY_PATH", Some("./root.key"), is_prod)?,
            },
            other => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Invalid key provider: {}",
                    other
                )))
            }
        };

        let config = ServerConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("control-plane"), false)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), false)?,
            log_level: get_env("LOG_LEVEL", Some("info"), false)?,
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", Some("memory"), is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "20", false)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "2", false)?,
            },
            redis,
            smtp,
            session: SessionConfig {
                duration: duration_env("SESSION_DURATION", "720h")?,
                inactivity_timeout: duration_env("SESSION_INACTIVITY_TIMEOUT", "72h")?,
            },
            signup: SignupConfig {
                enabled: parse_env("ENABLE_SIGNUP", "false", false)?,
                base_domain: get_env("BASE_DOMAIN", Some(""), false)?,
                default_org_name: get_env("DEFAULT_ORG_NAME", Some("Default"), false)?,
                default_org_domain: get_env("DEFAULT_ORG_DOMAIN", Some(""), false)?,
            },
            api: ApiConfig {
                request_timeout: duration_env("REQUEST_TIMEOUT", "60s")?,
                blocking_request_timeout: duration_env("BLOCKING_REQUEST_TIMEOUT", "35s")?,
                broker_wait: duration_env("BROKER_WAIT", "30s")?,
            },
            oidc: OidcConfig {
                http_timeout: duration_env("OIDC_HTTP_TIMEOUT", "10s")?,
            },
            rate_limit: RateLimitConfig {
                org_requests_per_minute: parse_env("RATE_LIMIT_ORG_REQUESTS_PER_MINUTE", "3000", false)?,
                login_attempts_per_minute: parse_env("RATE_LIMIT_LOGIN_ATTEMPTS_PER_MINUTE", "10", false)?,
                lockout_threshold: parse_env("RATE_LIMIT_LOCKOUT_THRESHOLD", "10", false)?,
                lockout_duration: duration_env("RATE_LIMIT_LOCKOUT_DURATION", "1m")?,
                signup_per_ip_per_hour: parse_env("RATE_LIMIT_SIGNUP_PER_IP_PER_HOUR", "10", false)?,
            },
            password_policy: PasswordPolicy {
                min_length: parse_env("PASSWORD_MIN_LENGTH", "8", false)?,
                min_letters: parse_env("PASSWORD_MIN_LETTERS", "1", false)?,
                min_digits: parse_env("PASSWORD_MIN_DIGITS", "0", false)?,
            },
            bcrypt_cost: parse_env("BCRYPT_COST", "10", false)?,
            key_provider,
            scheduler: SchedulerConfig {
                device_flow_purge_interval: duration_env("PURGE_DEVICE_FLOW_INTERVAL", "10m")?,
                access_key_purge_interval: duration_env("PURGE_ACCESS_KEYS_INTERVAL", "12h")?,
                password_reset_purge_interval: duration_env("PURGE_PASSWORD_RESET_INTERVAL", "15m")?,
                destination_credential_purge_interval: duration_env(
                    "PURGE_DESTINATION_CREDENTIALS_INTERVAL",
                    "10m",
                )?,
            },
            allowed_origins: get_env("ALLOWED_ORIGINS", Some(""), false)?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Settings for tests and local runs: memory store, no redis, no SMTP,
    /// cheap bcrypt.
    pub fn for_tests() -> Self {
        ServerConfig {
            common: core_config::Config {
                host: "127.0.0.1".to_string(),
                port: 0,
                log_level: "debug".to_string(),
                otlp_endpoint: None,
            },
            environment: Environment::Dev,
            service_name: "control-plane".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "debug".to_string(),
            database: DatabaseConfig {
                url: "memory".to_string(),
                max_connections: 1,
                min_connections: 1,
            },
            redis: None,
            smtp: None,
            session: SessionConfig {
                duration: Duration::from_secs(720 * 3600),
                inactivity_timeout: Duration::from_secs(72 * 3600),
            },
            signup: SignupConfig {
                enabled: false,
                base_domain: String::new(),
                default_org_name: "Default".to_string(),
                default_org_domain: "localhost".to_string(),
            },
            api: ApiConfig {
                request_timeout: Duration::from_secs(60),
                blocking_request_timeout: Duration::from_secs(35),
                broker_wait: Duration::from_secs(30),
            },
            oidc: OidcConfig {
                http_timeout: Duration::from_secs(10),
            },
            rate_limit: RateLimitConfig {
                org_requests_per_minute: 0,
                login_attempts_per_minute: 10,
                lockout_threshold: 10,
                lockout_duration: Duration::from_secs(60),
                signup_per_ip_per_hour: 100,
            },
            password_policy: PasswordPolicy::default(),
            bcrypt_cost: 4,
            key_provider: KeyProviderConfig::Env {
                variable: "CONTROL_PLANE_TEST_ROOT_KEY".to_string(),
            },
            scheduler: SchedulerConfig {
                device_flow_purge_interval: Duration::from_secs(600),
                access_key_purge_interval: Duration::from_secs(12 * 3600),
                password_reset_purge_interval: Duration::from_secs(900),
                destination_credential_purge_interval: Duration::from_secs(600),
            },
            allowed_origins: Vec::new(),
        }
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if !(4..=31).contains(&self.bcrypt_cost) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "BCRYPT_COST must be between 4 and 31"
            )));
        }

        if self.api.blocking_request_timeout < self.api.broker_wait + Duration::from_secs(5) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "BLOCKING_REQUEST_TIMEOUT must exceed BROKER_WAIT by at least 5s"
            )));
        }

        if let Some((name, _)) = self.scheduler.intervals().iter().find(|(_, every)| every.is_zero()) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "{} must be greater than zero",
                name
            )));
        }

        if self.signup.enabled && self.signup.base_domain.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "BASE_DOMAIN is required when signup is enabled"
            )));
        }

        if self.environment == Environment::Prod {
            if self.database.is_memory() {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "The memory store is not allowed in production"
                )));
            }

            if self.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if self.smtp.is_none() {
                tracing::warn!("SMTP is not configured; new users will receive one-time passwords");
            }
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

fn duration_env(key: &str, default: &str) -> Result<Duration, AppError> {
    let raw = get_env(key, Some(default), false)?;
    parse_duration(&raw).map_err(|e| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parses_case_insensitively() {
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Prod);
        assert!("staging".parse::<Environment>().is_err());
    }

    #[test]
    fn test_config_is_valid() {
        let mut config = ServerConfig::for_tests();
        config.common.port = 8080;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn purge_intervals_must_be_positive() {
        let mut config = ServerConfig::for_tests();
        config.common.port = 8080;
        config.scheduler.access_key_purge_interval = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("PURGE_ACCESS_KEYS_INTERVAL"), "{}", err);
    }

    #[test]
    fn blocking_timeout_must_cover_broker_wait() {
        let mut config = ServerConfig::for_tests();
        config.common.port = 8080;
        config.api.blocking_request_timeout = Duration::from_secs(30);
        assert!(config.validate().is_err());
    }

    #[test]
    fn signup_requires_base_domain() {
        let mut config = ServerConfig::for_tests();
        config.common.port = 8080;
        config.signup.enabled = true;
        assert!(config.validate().is_err());
        config.signup.base_domain = "example.com".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_required_value() {
        let err = get_env("CONTROL_PLANE_SURELY_UNSET", None, false).unwrap_err();
        assert!(err.to_string().contains("CONTROL_PLANE_SURELY_UNSET"));
        assert_eq!(
            get_env("CONTROL_PLANE_SURELY_UNSET", Some("x"), false).unwrap(),
            "x"
        );
    }
}
