//! Bridge configuration.
//!
//! Built once with the `with_*` builders (or [`BridgeConfig::from_env`]),
//! validated, then shared read-only by every component.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Retry tunables. See [`crate::retry::RetryPolicy`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Circuit breaker tunables. See [`crate::circuit_breaker::CircuitBreaker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time spent open before a trial call is allowed.
    pub reset_timeout: Duration,
    /// Trial calls permitted while half-open; this many successes close it.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unsupported encoding '{0}': only utf-8 is supported")]
    UnsupportedEncoding(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("retry backoff multiplier must be >= 1.0")]
    BackoffMultiplier,
    #[error("retry max backoff is smaller than the initial backoff")]
    BackoffBounds,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Server working directory. Consumed by the process manager only.
    pub working_directory: Option<PathBuf>,
    /// Extra server arguments. Consumed by the process manager only.
    pub extra_args: Vec<String>,
    /// Default deadline applied by [`crate::ResponseHandle::wait`]. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Largest frame body accepted or sent, in bytes.
    pub max_message_size: usize,
    pub encoding: String,
    /// Concurrent event fan-outs.
    pub dispatcher_pool_size: usize,
    /// Frames that may wait for the writer before submit fails.
    pub write_queue_capacity: usize,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub log_requests: bool,
    pub log_responses: bool,
    /// Upper bound on how long shutdown waits for the read and write tasks to stop.
    /// Frames still queued at shutdown are dropped.
    pub shutdown_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            working_directory: None,
            extra_args: Vec::new(),
            request_timeout: Some(Duration::from_secs(30)),
            max_message_size: 16 * 1024 * 1024,
            encoding: "utf-8".to_string(),
            dispatcher_pool_size: 4,
            write_queue_capacity: 256,
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            log_requests: false,
            log_responses: false,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `OMNILINK_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, "OMNILINK_REQUEST_TIMEOUT_MS") {
            config.request_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(n) = parse_var(&lookup, "OMNILINK_MAX_MESSAGE_SIZE") {
            config.max_message_size = n;
        }
        if let Some(n) = parse_var(&lookup, "OMNILINK_DISPATCHER_POOL_SIZE") {
            config.dispatcher_pool_size = n;
        }
        if let Some(n) = parse_var(&lookup, "OMNILINK_WRITE_QUEUE_CAPACITY") {
            config.write_queue_capacity = n;
        }
        if let Some(n) = parse_var(&lookup, "OMNILINK_CB_FAILURE_THRESHOLD") {
            config.circuit_breaker.failure_threshold = n;
        }
        if let Some(ms) = parse_var(&lookup, "OMNILINK_CB_RESET_TIMEOUT_MS") {
            config.circuit_breaker.reset_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&lookup, "OMNILINK_CB_HALF_OPEN_MAX_CALLS") {
            config.circuit_breaker.half_open_max_calls = n;
        }
        if let Some(n) = parse_var(&lookup, "OMNILINK_RETRY_MAX_RETRIES") {
            config.retry.max_retries = n;
        }
        if let Some(ms) = parse_var(&lookup, "OMNILINK_RETRY_INITIAL_BACKOFF_MS") {
            config.retry.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(m) = parse_var(&lookup, "OMNILINK_RETRY_BACKOFF_MULTIPLIER") {
            config.retry.backoff_multiplier = m;
        }
        if let Some(ms) = parse_var(&lookup, "OMNILINK_RETRY_MAX_BACKOFF_MS") {
            config.retry.max_backoff = Duration::from_millis(ms);
        }
        if let Some(b) = parse_flag(&lookup, "OMNILINK_LOG_REQUESTS") {
            config.log_requests = b;
        }
        if let Some(b) = parse_flag(&lookup, "OMNILINK_LOG_RESPONSES") {
            config.log_responses = b;
        }
        if let Some(ms) = parse_var(&lookup, "OMNILINK_SHUTDOWN_GRACE_MS") {
            config.shutdown_grace = Duration::from_millis(ms);
        }

        config
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    pub fn with_dispatcher_pool_size(mut self, n: usize) -> Self {
        self.dispatcher_pool_size = n;
        self
    }

    pub fn with_write_queue_capacity(mut self, n: usize) -> Self {
        self.write_queue_capacity = n;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    pub fn with_logging(mut self, requests: bool, responses: bool) -> Self {
        self.log_requests = requests;
        self.log_responses = responses;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let encoding = self.encoding.to_ascii_lowercase();
        if encoding != "utf-8" && encoding != "utf8" {
            return Err(ConfigError::UnsupportedEncoding(self.encoding.clone()));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Zero("max_message_size"));
        }
        if self.dispatcher_pool_size == 0 {
            return Err(ConfigError::Zero("dispatcher_pool_size"));
        }
        if self.write_queue_capacity == 0 {
            return Err(ConfigError::Zero("write_queue_capacity"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Zero("circuit_breaker.failure_threshold"));
        }
        if self.circuit_breaker.half_open_max_calls == 0 {
            return Err(ConfigError::Zero("circuit_breaker.half_open_max_calls"));
        }
        if self.retry.backoff_multiplier.is_nan() || self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::BackoffMultiplier);
        }
        if self.retry.max_backoff < self.retry.initial_backoff {
            return Err(ConfigError::BackoffBounds);
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable configuration value");
            None
        }
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable configuration flag");
            None
        }
    }
}
