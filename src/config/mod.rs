//! Configuration management for resilient-sync
//!
//! This module handles loading, parsing, and validating the scheduler
//! configuration from YAML files and environment variables. Source
//! configuration is static: it is read once when the scheduler is built.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Names of the sources in the default catalog
pub const DEFAULT_SOURCES: [&str; 7] = [
    "airdrops",
    "quests",
    "points",
    "protocols",
    "token_prices",
    "wallet_activity",
    "governance",
];

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Scheduler-wide options
    #[serde(default)]
    pub scheduler: SchedulerOptions,

    /// Source catalog, keyed by source name
    #[serde(default = "default_sources")]
    pub sources: BTreeMap<String, SourceConfig>,

    /// HTTP handler configuration
    #[serde(default)]
    pub http: HttpConfig,

    /// OpenTelemetry configuration
    #[serde(default)]
    pub otel: OtelConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerOptions::default(),
            sources: default_sources(),
            http: HttpConfig::default(),
            otel: OtelConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(yaml);
        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables with prefix RESILIENT_SYNC_
    ///
    /// The source catalog is the default one; each source's endpoint can be
    /// set with `RESILIENT_SYNC_<SOURCE>_ENDPOINT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Ok(level) = std::env::var("RESILIENT_SYNC_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("RESILIENT_SYNC_LOG_FORMAT") {
            config.logging.format = format;
        }

        if let Ok(timeout) = std::env::var("RESILIENT_SYNC_HANDLER_TIMEOUT_MS") {
            let timeout = timeout
                .parse()
                .map_err(|_| ConfigError::Parse("Invalid handler timeout".to_string()))?;
            config.scheduler.handler_timeout_ms = Some(timeout);
        }

        if let Ok(enabled) = std::env::var("RESILIENT_SYNC_OTEL_ENABLED") {
            config.otel.enabled = enabled.parse().unwrap_or(false);
        }
        if let Ok(endpoint) = std::env::var("RESILIENT_SYNC_OTEL_ENDPOINT") {
            config.otel.endpoint = Some(endpoint);
        }

        for (name, source) in config.sources.iter_mut() {
            let var = format!("RESILIENT_SYNC_{}_ENDPOINT", name.to_uppercase());
            if let Ok(endpoint) = std::env::var(&var) {
                source.endpoint = Some(endpoint);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check every source configuration for values the scheduler cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::MissingRequired("sources".to_string()));
        }
        for (name, source) in &self.sources {
            source.validate(name)?;
        }
        if self.http.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue(
                "http.max_concurrent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Scheduler-wide options
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SchedulerOptions {
    /// Deadline for a single handler invocation; no deadline when unset
    #[serde(default)]
    pub handler_timeout_ms: Option<u64>,
}

impl SchedulerOptions {
    /// Handler deadline as a `Duration`
    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }
}

/// Static configuration for one source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    /// Recurring schedule period in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Sliding-window admission limits
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Retry backoff policy
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Circuit breaker thresholds
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Upstream URL fetched by the HTTP handler
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            rate_limit: RateLimitConfig::default(),
            backoff: BackoffConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            endpoint: None,
        }
    }
}

impl SourceConfig {
    /// Recurring schedule period
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Reject values the scheduler cannot run with
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: &str| {
            Err(ConfigError::InvalidValue(format!(
                "sources.{}.{} {}",
                name, field, reason
            )))
        };

        if self.interval_ms == 0 {
            return invalid("interval_ms", "must be greater than 0");
        }
        if self.rate_limit.max_requests == 0 {
            return invalid("rate_limit.max_requests", "must be greater than 0");
        }
        if self.rate_limit.window_ms == 0 {
            return invalid("rate_limit.window_ms", "must be greater than 0");
        }
        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return invalid("backoff.base_delay_ms", "must not exceed max_delay_ms");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return invalid("circuit_breaker.failure_threshold", "must be greater than 0");
        }
        if self.circuit_breaker.half_open_max_attempts == 0 {
            return invalid(
                "circuit_breaker.half_open_max_attempts",
                "must be greater than 0",
            );
        }
        Ok(())
    }
}

fn default_interval_ms() -> u64 {
    300_000 // 5 minutes
}

/// Sliding-window rate limit for one source
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum admitted requests per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
        }
    }
}

impl RateLimitConfig {
    /// Window length as a `Duration`
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

fn default_max_requests() -> u32 {
    10
}

fn default_window_ms() -> u64 {
    60_000
}

/// Exponential backoff policy for one source
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on the pre-jitter delay, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

/// Circuit breaker thresholds for one source
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time spent open before probing, in milliseconds
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Trial requests allowed while half-open
    #[serde(default = "default_half_open_max_attempts")]
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_attempts: default_half_open_max_attempts(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Open period as a `Duration`
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

fn default_half_open_max_attempts() -> u32 {
    1
}

/// Build the default seven-source catalog
///
/// Fast-moving feeds poll more often with a larger request budget; slow
/// feeds back off further.
pub fn default_sources() -> BTreeMap<String, SourceConfig> {
    let source = |interval_ms: u64, max_requests: u32, max_delay_ms: u64| SourceConfig {
        interval_ms,
        rate_limit: RateLimitConfig {
            max_requests,
            window_ms: 60_000,
        },
        backoff: BackoffConfig {
            base_delay_ms: 1_000,
            max_delay_ms,
        },
        ..SourceConfig::default()
    };

    BTreeMap::from([
        ("airdrops".to_string(), source(300_000, 10, 60_000)),
        ("quests".to_string(), source(300_000, 10, 60_000)),
        ("points".to_string(), source(600_000, 5, 120_000)),
        ("protocols".to_string(), source(3_600_000, 5, 300_000)),
        ("token_prices".to_string(), source(60_000, 30, 30_000)),
        ("wallet_activity".to_string(), source(120_000, 20, 60_000)),
        ("governance".to_string(), source(1_800_000, 5, 300_000)),
    ])
}

/// HTTP handler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpConfig {
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum number of concurrent upstream requests
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// User-Agent header sent upstream
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            max_concurrent: default_max_concurrent(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    4
}

fn default_user_agent() -> String {
    format!("resilient-sync/{}", env!("CARGO_PKG_VERSION"))
}

/// OpenTelemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OtelConfig {
    /// Whether OpenTelemetry export is enabled
    #[serde(default)]
    pub enabled: bool,

    /// OTLP endpoint URL
    pub endpoint: Option<String>,

    /// Service name for traces and metrics
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            service_name: default_service_name(),
        }
    }
}

fn default_service_name() -> String {
    "resilient-sync".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Configuration error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read configuration file: {0}")]
    FileRead(String),

    /// Error parsing configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

/// Expand environment variables in a string
///
/// Supports `${VAR_NAME}` syntax; unknown variables are left as-is.
fn expand_env_vars(input: &str) -> String {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .expect("Invalid regex pattern for environment variable expansion");

    re.replace_all(input, |caps: &regex_lite::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}
