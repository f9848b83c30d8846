//! Configuration management for Authguard.
//!
//! Settings come from an optional YAML file layered under environment
//! variables. `RATE_LIMIT_BACKEND` and `REDIS_URL` are read verbatim and
//! ignored when empty; every other field can be overridden with an `AUTHGUARD_` variable using `__`
//! between nesting levels (e.g. `AUTHGUARD_LOGIN__MAX_PER_EMAIL=10`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};
use crate::lockout::LockoutConfig;
use crate::ratelimit::LimitConfig;

/// Which rate limiting backend to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local sliding windows
    #[default]
    Memory,
    /// Shared-store sliding windows for multi-instance deployments
    #[serde(alias = "redis")]
    Distributed,
}

/// Main configuration for the Authguard service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardSettings {
    /// Backend selector
    #[serde(default)]
    pub rate_limit_backend: BackendKind,

    /// Connection string for the shared store
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Shared store timeouts
    #[serde(default)]
    pub redis: RedisSettings,

    /// Interval between background sweeps, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Login protection policy
    #[serde(default)]
    pub login: LoginSettings,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Accounts accepted by the demo binary
    #[serde(default)]
    pub accounts: Vec<AccountEntry>,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            rate_limit_backend: BackendKind::default(),
            redis_url: None,
            redis: RedisSettings::default(),
            sweep_interval_secs: default_sweep_interval(),
            login: LoginSettings::default(),
            server: ServerSettings::default(),
            accounts: Vec::new(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    300
}

const ENV_PREFIX: &str = "AUTHGUARD";

/// An unset variable and an empty one both mean "not configured".
fn non_empty(env: &HashMap<String, String>, name: &str) -> Option<String> {
    env.get(name).filter(|value| !value.is_empty()).cloned()
}

impl GuardSettings {
    /// Load settings from an optional YAML file, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, std::env::vars().collect())
    }

    /// Load settings from an optional YAML file layered under `env`.
    pub fn load_with_env(path: Option<&Path>, env: HashMap<String, String>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            let path = path
                .to_str()
                .ok_or_else(|| GuardError::Config(format!("Non UTF-8 config path: {:?}", path)))?;
            builder = builder.add_source(File::new(path, FileFormat::Yaml));
        }

        let backend = non_empty(&env, "RATE_LIMIT_BACKEND");
        let redis_url = non_empty(&env, "REDIS_URL");

        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true)
                    .source(Some(env)),
            )
            .set_override_option("rate_limit_backend", backend)
            .and_then(|b| b.set_override_option("redis_url", redis_url))
            .and_then(|b| b.build())
            .and_then(|c| c.try_deserialize::<GuardSettings>())
            .map_err(|e| GuardError::Config(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: GuardSettings = serde_yaml::from_str(yaml)
            .map_err(|e| GuardError::Config(format!("Failed to parse settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check every limit the settings would produce.
    pub fn validate(&self) -> Result<()> {
        self.login.email_limit().validate()?;
        self.login.ip_limit().validate()?;
        self.login.lockout().validate()?;
        if self.sweep_interval_secs == 0 {
            return Err(GuardError::Config(
                "sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Background sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Shared store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    /// Bound on connecting and the startup health probe, in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Bound on each command at request time, in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_command_timeout() -> u64 {
    1000
}

impl RedisSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Limits applied to the login endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginSettings {
    /// Attempts per email address per window
    #[serde(default = "default_max_per_email")]
    pub max_per_email: u32,

    /// Attempts per client address per window
    #[serde(default = "default_max_per_ip")]
    pub max_per_ip: u32,

    /// Rate limit window, in seconds
    #[serde(default = "default_login_window")]
    pub window_secs: u64,

    /// Failed attempts before an account locks
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// How long a lock lasts, in seconds
    #[serde(default = "default_login_window")]
    pub lockout_secs: u64,

    /// Window for counting failures, in seconds
    #[serde(default = "default_login_window")]
    pub failure_window_secs: u64,

    /// Relax all limits for automated test environments
    #[serde(default)]
    pub development: bool,
}

impl Default for LoginSettings {
    fn default() -> Self {
        Self {
            max_per_email: default_max_per_email(),
            max_per_ip: default_max_per_ip(),
            window_secs: default_login_window(),
            max_failures: default_max_failures(),
            lockout_secs: default_login_window(),
            failure_window_secs: default_login_window(),
            development: false,
        }
    }
}

fn default_max_per_email() -> u32 {
    5
}

fn default_max_per_ip() -> u32 {
    20
}

fn default_max_failures() -> u32 {
    5
}

fn default_login_window() -> u64 {
    900
}

const DEVELOPMENT_MAX_PER_EMAIL: u32 = 1000;
const DEVELOPMENT_MAX_PER_IP: u32 = 5000;
const DEVELOPMENT_MAX_FAILURES: u32 = 1000;

impl LoginSettings {
    /// Per-email limit.
    pub fn email_limit(&self) -> LimitConfig {
        let max = if self.development {
            DEVELOPMENT_MAX_PER_EMAIL
        } else {
            self.max_per_email
        };
        LimitConfig::new(max, Duration::from_secs(self.window_secs))
    }

    /// Per-address limit.
    pub fn ip_limit(&self) -> LimitConfig {
        let max = if self.development {
            DEVELOPMENT_MAX_PER_IP
        } else {
            self.max_per_ip
        };
        LimitConfig::new(max, Duration::from_secs(self.window_secs))
    }

    /// Lockout policy.
    pub fn lockout(&self) -> LockoutConfig {
        let max_failures = if self.development {
            DEVELOPMENT_MAX_FAILURES
        } else {
            self.max_failures
        };
        LockoutConfig {
            max_failures,
            lockout_duration: Duration::from_secs(self.lockout_secs),
            failure_window: Duration::from_secs(self.failure_window_secs),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address the demo service binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// A login identity known to the demo binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountEntry {
    /// Login email
    pub email: String,
    /// bcrypt hash of the password
    pub password_hash: String,
}
