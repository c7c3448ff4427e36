use crate::error::{Error, Result};
use crate::mode::SwitchConfig;
use crate::policy::{PolicyConfig, PolicyRegistry, RateLimitPolicy};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Validate)]
#[validate(schema(function = "validate_modes"))]
pub struct Config {
    /// Server bind address
    pub bind_addr: SocketAddr,

    /// Redis connection URL
    #[validate(custom(function = "validate_redis_url"))]
    pub redis_url: String,

    /// Upper bound on one shared-store round trip
    #[validate(range(min = 1, max = 5000))]
    pub redis_timeout_ms: u64,

    pub redis_key_prefix: String,

    /// Serve every decision from the local store
    pub disable_redis: bool,

    /// Bypass admission control entirely; refused in production
    pub skip_rate_limit: bool,

    pub environment: String,

    #[validate(range(min = 1, max = 86400))]
    pub default_window_secs: u64,

    #[validate(range(min = 1))]
    pub default_max_requests: u32,

    #[validate(range(min = 1))]
    pub sweep_interval_secs: u64,

    #[validate(range(min = 60))]
    pub retention_secs: u64,

    #[validate(range(min = 1, max = 1000))]
    pub failure_threshold: u32,

    #[validate(range(min = 1))]
    pub probe_interval_secs: u64,

    /// JSON policy table; built-in categories when unset
    pub policy_file: Option<PathBuf>,

    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            redis_timeout_ms: 200,
            redis_key_prefix: "ratelimit:".to_string(),
            disable_redis: false,
            skip_rate_limit: false,
            environment: "development".to_string(),
            default_window_secs: 60,
            default_max_requests: 100,
            sweep_interval_secs: 300,
            retention_secs: 3600,
            failure_threshold: 3,
            probe_interval_secs: 30,
            policy_file: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            bind_addr: env_or("BIND_ADDR", defaults.bind_addr)?,
            redis_url: env_or("REDIS_URL", defaults.redis_url)?,
            redis_timeout_ms: env_or("REDIS_TIMEOUT_MS", defaults.redis_timeout_ms)?,
            redis_key_prefix: env_or("REDIS_KEY_PREFIX", defaults.redis_key_prefix)?,
            disable_redis: env_or("RATE_LIMIT_DISABLE_REDIS", defaults.disable_redis)?,
            skip_rate_limit: env_or("RATE_LIMIT_SKIP", defaults.skip_rate_limit)?,
            environment: env_or("APP_ENV", defaults.environment)?,
            default_window_secs: env_or("RATE_LIMIT_DEFAULT_WINDOW_SECS", defaults.default_window_secs)?,
            default_max_requests: env_or(
                "RATE_LIMIT_DEFAULT_MAX_REQUESTS",
                defaults.default_max_requests,
            )?,
            sweep_interval_secs: env_or("FALLBACK_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs)?,
            retention_secs: env_or("FALLBACK_RETENTION_SECS", defaults.retention_secs)?,
            failure_threshold: env_or("FALLBACK_FAILURE_THRESHOLD", defaults.failure_threshold)?,
            probe_interval_secs: env_or("FALLBACK_PROBE_INTERVAL_SECS", defaults.probe_interval_secs)?,
            policy_file: env::var("POLICY_FILE")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            log_level: env_or("LOG_LEVEL", defaults.log_level)?,
        })
    }

    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::Configuration(e.to_string()))
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn default_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy::new(
            Duration::from_secs(self.default_window_secs),
            self.default_max_requests,
            "General traffic",
        )
    }

    pub fn redis_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn switch_config(&self) -> SwitchConfig {
        SwitchConfig {
            failure_threshold: self.failure_threshold,
            probe_interval: Duration::from_secs(self.probe_interval_secs),
        }
    }

    /// The policy file if one is configured, otherwise the built-in table.
    pub fn load_policies(&self) -> Result<PolicyRegistry> {
        let table = match &self.policy_file {
            Some(path) => PolicyConfig::from_file(path)?,
            None => PolicyConfig::builtin(),
        };
        PolicyRegistry::compile(table, self.default_policy())
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| Error::Configuration(format!("{}: {}", key, e))),
        _ => Ok(default),
    }
}

fn validate_redis_url(url: &str) -> std::result::Result<(), ValidationError> {
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        Ok(())
    } else {
        Err(ValidationError::new("redis_url_scheme"))
    }
}

fn validate_modes(config: &Config) -> std::result::Result<(), ValidationError> {
    if config.skip_rate_limit && config.is_production() {
        return Err(ValidationError::new("skip_rate_limit_in_production"));
    }
    Ok(())
}
