//! Configuration management for Turnstile.
//!
//! Supplied once at process start and immutable afterwards.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::admission::{AdmissionPolicy, DegradePolicy, RouteClassConfig};
use crate::error::{Result, TurnstileError};
use crate::store::{BackoffStrategy, CappedLinear, FixedDelay, Timeouts};

/// Prefix for environment overrides, e.g. `TURNSTILE__ADMISSION__MAX_REQUESTS`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Session store configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Shared store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store connection URL
    #[serde(default = "default_url")]
    pub url: String,

    /// TLS settings
    #[serde(default)]
    pub tls: TlsConfig,

    /// Upper bound on one connection attempt, in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Upper bound on one store operation, in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Prefix for every key written by the admission layer
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Reconnect backoff
    #[serde(default)]
    pub reconnect: BackoffConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            tls: TlsConfig::default(),
            connect_timeout_ms: default_connect_timeout(),
            operation_timeout_ms: default_operation_timeout(),
            key_prefix: default_key_prefix(),
            reconnect: BackoffConfig::default(),
        }
    }
}

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_connect_timeout() -> u64 {
    1000
}

fn default_operation_timeout() -> u64 {
    250
}

fn default_key_prefix() -> String {
    "turnstile".to_string()
}

/// TLS settings for the store connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Connect over TLS
    #[serde(default)]
    pub enabled: bool,

    /// Verify the server certificate
    #[serde(default = "default_true")]
    pub verify_certificates: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            verify_certificates: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Reconnect backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// `min(failures * step_ms, max_delay_ms)`, retrying forever
    CappedLinear { step_ms: u64, max_delay_ms: u64 },
    /// `delay_ms` between attempts, abandoning after `max_attempts` failures
    FixedDelay { delay_ms: u64, max_attempts: u32 },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::CappedLinear {
            step_ms: 100,
            max_delay_ms: 3000,
        }
    }
}

impl BackoffConfig {
    /// Build the strategy this configuration describes.
    pub fn strategy(&self) -> Arc<dyn BackoffStrategy> {
        match *self {
            BackoffConfig::CappedLinear {
                step_ms,
                max_delay_ms,
            } => Arc::new(CappedLinear::new(
                Duration::from_millis(step_ms),
                Duration::from_millis(max_delay_ms),
            )),
            BackoffConfig::FixedDelay {
                delay_ms,
                max_attempts,
            } => Arc::new(FixedDelay::new(Duration::from_millis(delay_ms), max_attempts)),
        }
    }

    fn validate(&self, section: &str) -> Result<()> {
        match *self {
            BackoffConfig::CappedLinear {
                step_ms,
                max_delay_ms,
            } => {
                if step_ms == 0 {
                    return Err(invalid(format!("{}.step_ms must be positive", section)));
                }
                if max_delay_ms < step_ms {
                    return Err(invalid(format!(
                        "{}.max_delay_ms must be at least step_ms",
                        section
                    )));
                }
            }
            BackoffConfig::FixedDelay { max_attempts, .. } => {
                if max_attempts == 0 {
                    return Err(invalid(format!(
                        "{}.max_attempts must be positive",
                        section
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Requests admitted per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Path patterns that bypass admission entirely
    #[serde(default = "default_excluded_paths")]
    pub excluded_paths: Vec<String>,

    /// Behaviour when the store is unreachable
    #[serde(default)]
    pub degrade: DegradePolicy,

    /// Path prefixes counted in their own buckets
    #[serde(default)]
    pub route_classes: Vec<RouteClassConfig>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
            excluded_paths: default_excluded_paths(),
            degrade: DegradePolicy::default(),
            route_classes: Vec::new(),
        }
    }
}

fn default_max_requests() -> u64 {
    100
}

fn default_window_secs() -> u64 {
    60
}

fn default_excluded_paths() -> Vec<String> {
    vec!["/api/webhooks".to_string()]
}

impl AdmissionConfig {
    /// Build the validated policy.
    pub fn policy(&self) -> Result<AdmissionPolicy> {
        Ok(AdmissionPolicy::new(self.max_requests, self.window_secs)?
            .with_rules(&self.excluded_paths, &self.route_classes)?
            .with_degrade(self.degrade))
    }
}

/// Session store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Default session lifetime in seconds
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,

    /// Key prefix, appended to the store key prefix
    #[serde(default = "default_session_prefix")]
    pub key_prefix: String,

    /// Separate reconnect backoff for sessions. When set, sessions use their
    /// own connection; otherwise they share the admission connection.
    #[serde(default)]
    pub reconnect: Option<BackoffConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            key_prefix: default_session_prefix(),
            reconnect: None,
        }
    }
}

fn default_session_ttl() -> u64 {
    86_400
}

fn default_session_prefix() -> String {
    "sess".to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn invalid(message: String) -> TurnstileError {
    TurnstileError::InvalidConfiguration(message)
}

impl TurnstileConfig {
    /// Load configuration from an optional file plus `TURNSTILE__*`
    /// environment variables, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("admission.excluded_paths")
                .try_parsing(true),
        );

        let config: TurnstileConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| invalid(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| invalid(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the admission layer cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.admission.policy()?;

        if self.store.url.trim().is_empty() {
            return Err(invalid("store.url must not be empty".to_string()));
        }
        if let Err(e) = redis::Client::open(self.store.connection_url().as_str()) {
            return Err(invalid(format!("store.url is not a valid store URL: {}", e)));
        }
        if self.store.connect_timeout_ms == 0 || self.store.operation_timeout_ms == 0 {
            return Err(invalid("store timeouts must be positive".to_string()));
        }
        if self.store.key_prefix.is_empty() {
            return Err(invalid("store.key_prefix must not be empty".to_string()));
        }
        self.store.reconnect.validate("store.reconnect")?;

        if self.session.ttl_secs == 0 {
            return Err(invalid("session.ttl_secs must be positive".to_string()));
        }
        if let Some(reconnect) = &self.session.reconnect {
            reconnect.validate("session.reconnect")?;
        }

        Ok(())
    }
}

impl StoreConfig {
    /// Connection URL with the TLS settings applied.
    ///
    /// TLS switches `redis://` to `rediss://`; disabling certificate
    /// verification adds the `#insecure` fragment the client understands.
    pub fn connection_url(&self) -> String {
        let url = self.url.trim();
        if !self.tls.enabled {
            return url.to_string();
        }

        let mut url = match url.strip_prefix("redis://") {
            Some(rest) => format!("rediss://{}", rest),
            None => url.to_string(),
        };
        if !self.tls.verify_certificates && !url.ends_with("#insecure") {
            url.push_str("#insecure");
        }
        url
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            operation: Duration::from_millis(self.operation_timeout_ms),
        }
    }
}
