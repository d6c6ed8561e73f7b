//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with defaults
//! suitable for development. A `.env` file in the working directory is read
//! first if present.
//!
//! # Admission Control
//!
//! - `RATE_LIMIT_RATE`: Tokens per second per key (default: 10, 0 = disabled)
//! - `RATE_LIMIT_CAPACITY`: Bucket capacity (default: 20)
//! - `RATE_LIMIT_KEY`: `ip` or `user` (default: `ip`)
//! - `BUCKET_IDLE_TTL_SECS` / `BUCKET_SWEEP_INTERVAL_SECS`: idle bucket eviction
//! - `REQUEST_TIMEOUT_MS`: Deadline budget (default: 30000, 0 = disabled)
//! - `ABORT_ON_TIMEOUT`: Abort abandoned inner tasks (default: false)
//!
//! # Security Configuration
//!
//! - `AUTH_MODE`: `required`, `optional` or `off` (default: `required`)
//! - `AUTH_BYPASS_PATHS`: Exact paths that skip authentication
//! - `AUTH_TOKEN_HEADER` / `AUTH_TOKEN_PREFIX`: Where the credential is read from
//! - `AUTH_TOKENS`: Static credentials, `token:subject:name[:expires_at]`, comma-separated
//! - `TRUSTED_PROXIES`: CIDR ranges allowed to set `X-Forwarded-For`
//! - `CORS_ALLOWED_ORIGINS`: Comma-separated list of allowed origins (default: `*`)

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use axum::http::HeaderName;

use crate::error::{AppError, AppResult};
use crate::identity::parse_token_spec;
use crate::middleware::AuthMode;

/// Longest accepted `REQUEST_TIMEOUT_MS` (24 hours).
const MAX_REQUEST_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// What the rate limiter keys buckets by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitKey {
    /// Caller network address.
    #[default]
    Ip,
    /// Authenticated subject, falling back to the address.
    User,
}

impl FromStr for RateLimitKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ip" => Ok(RateLimitKey::Ip),
            "user" => Ok(RateLimitKey::User),
            other => Err(format!("unknown rate limit key '{other}', expected ip or user")),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}', expected pretty or json")),
        }
    }
}

/// Boolean flag accepting `true/false`, `1/0`, `yes/no` and `on/off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Flag(bool);

impl FromStr for Flag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Flag(true)),
            "false" | "0" | "no" | "off" | "" => Ok(Flag(false)),
            other => Err(format!("expected a boolean, got '{other}'")),
        }
    }
}

/// Application configuration.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Tokens added per second per key (default: 10). 0 disables limiting.
    pub rate_limit_rate: f64,

    /// Bucket capacity, i.e. the burst a fresh key may send (default: 20)
    pub rate_limit_capacity: u32,

    /// Bucket key derivation (default: ip)
    pub rate_limit_key: RateLimitKey,

    /// Buckets idle this long are evicted (default: 600s, 0 = never).
    /// Never shorter than capacity / rate in effect.
    pub bucket_idle_ttl: Duration,

    /// How often idle buckets are swept (default: 60s)
    pub bucket_sweep_interval: Duration,

    // =========================================================================
    // Deadline Configuration
    // =========================================================================
    /// Budget for downstream processing (default: 30s, 0 = no deadline guard)
    pub request_timeout: Duration,

    /// Abort inner tasks that outlive their deadline (default: false)
    pub abort_on_timeout: bool,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// Authentication mode (default: required)
    pub auth_mode: AuthMode,

    /// Exact paths that bypass authentication.
    /// Default: ["/health", "/ping"]
    pub auth_bypass_paths: Vec<String>,

    /// Header carrying the credential (default: "authorization")
    pub auth_token_header: String,

    /// Scheme prefix before the credential (default: "Bearer").
    /// Empty means the whole header value is the credential.
    pub auth_token_prefix: String,

    /// Static credentials, `token:subject:name[:expires_at]`
    pub auth_tokens: Vec<String>,

    /// Comma-separated list of allowed CORS origins
    /// Use "*" to allow all origins (not recommended for production)
    pub cors_allowed_origins: Vec<String>,

    /// Trusted proxy CIDR ranges. Forwarding headers from other peers are
    /// ignored once any range is configured.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,172.16.0.0/12")
    /// Default: Empty (trust all sources - NOT recommended for production)
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Fault Handling Configuration
    // =========================================================================
    /// Include panic messages in 500 bodies (default: false, debug only)
    pub recovery_expose_detail: bool,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log filter (e.g., "info", "turnstile=debug")
    pub log_level: String,

    /// Log output format (default: pretty)
    pub log_format: LogFormat,

    /// Requests slower than this are logged at warn (default: 200ms)
    pub slow_request_threshold: Duration,

    /// Paths not written to the access log
    pub access_log_skip_paths: Vec<String>,

    /// Port for Prometheus metrics endpoint (default: 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if a value cannot be parsed or the
    /// combination is invalid.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_source(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`Config::from_env`].
    pub fn from_source<F>(var: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            // Server
            host: var("HOST").unwrap_or(defaults.host),
            port: parse_var(&var, "PORT", defaults.port)?,

            // Rate limiting
            rate_limit_rate: parse_var(&var, "RATE_LIMIT_RATE", defaults.rate_limit_rate)?,
            rate_limit_capacity: parse_var(
                &var,
                "RATE_LIMIT_CAPACITY",
                defaults.rate_limit_capacity,
            )?,
            rate_limit_key: parse_var(&var, "RATE_LIMIT_KEY", defaults.rate_limit_key)?,
            bucket_idle_ttl: Duration::from_secs(parse_var(&var, "BUCKET_IDLE_TTL_SECS", 600)?),
            bucket_sweep_interval: Duration::from_secs(parse_var(
                &var,
                "BUCKET_SWEEP_INTERVAL_SECS",
                60,
            )?),

            // Deadline
            request_timeout: Duration::from_millis(parse_var(
                &var,
                "REQUEST_TIMEOUT_MS",
                30_000,
            )?),
            abort_on_timeout: parse_var(&var, "ABORT_ON_TIMEOUT", Flag(false))?.0,

            // Security
            auth_mode: parse_var(&var, "AUTH_MODE", defaults.auth_mode)?,
            auth_bypass_paths: list_var(&var, "AUTH_BYPASS_PATHS", defaults.auth_bypass_paths)
                .into_iter()
                .filter(|p| p.starts_with('/'))
                .collect(),
            auth_token_header: var("AUTH_TOKEN_HEADER")
                .map(|h| h.trim().to_ascii_lowercase())
                .unwrap_or(defaults.auth_token_header),
            auth_token_prefix: var("AUTH_TOKEN_PREFIX")
                .map(|p| p.trim().to_string())
                .unwrap_or(defaults.auth_token_prefix),
            auth_tokens: list_var(&var, "AUTH_TOKENS", Vec::new()),
            cors_allowed_origins: list_var(
                &var,
                "CORS_ALLOWED_ORIGINS",
                defaults.cors_allowed_origins,
            ),
            trusted_proxies: list_var(&var, "TRUSTED_PROXIES", Vec::new()),

            // Fault handling
            recovery_expose_detail: parse_var(&var, "RECOVERY_EXPOSE_DETAIL", Flag(false))?.0,

            // Observability
            log_level: var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parse_var(&var, "LOG_FORMAT", defaults.log_format)?,
            slow_request_threshold: Duration::from_millis(parse_var(
                &var,
                "SLOW_REQUEST_THRESHOLD_MS",
                200,
            )?),
            access_log_skip_paths: list_var(
                &var,
                "ACCESS_LOG_SKIP_PATHS",
                defaults.access_log_skip_paths,
            ),
            metrics_port: parse_var(&var, "METRICS_PORT", defaults.metrics_port)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        if !self.rate_limit_rate.is_finite() || self.rate_limit_rate < 0.0 {
            return Err(AppError::ConfigError(format!(
                "RATE_LIMIT_RATE must be a finite number >= 0, got {}",
                self.rate_limit_rate
            )));
        }

        if self.rate_limiting_enabled() && self.rate_limit_capacity == 0 {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_CAPACITY must be greater than 0 when rate limiting is enabled"
                    .to_string(),
            ));
        }

        if self.eviction_enabled() && self.bucket_sweep_interval.is_zero() {
            return Err(AppError::ConfigError(
                "BUCKET_SWEEP_INTERVAL_SECS must be greater than 0 when eviction is enabled"
                    .to_string(),
            ));
        }

        if self.request_timeout > Duration::from_millis(MAX_REQUEST_TIMEOUT_MS) {
            return Err(AppError::ConfigError(format!(
                "REQUEST_TIMEOUT_MS must be at most {MAX_REQUEST_TIMEOUT_MS}"
            )));
        }

        self.token_header()?;

        for spec in &self.auth_tokens {
            parse_token_spec(spec).map_err(AppError::ConfigError)?;
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if rate limiting is enabled.
    pub fn rate_limiting_enabled(&self) -> bool {
        self.rate_limit_rate > 0.0
    }

    /// Check if idle bucket eviction is enabled.
    pub fn eviction_enabled(&self) -> bool {
        self.rate_limiting_enabled() && !self.bucket_idle_ttl.is_zero()
    }

    /// Check if the deadline guard is installed.
    pub fn deadline_enabled(&self) -> bool {
        !self.request_timeout.is_zero()
    }

    /// Check if the auth gate is installed.
    pub fn auth_enabled(&self) -> bool {
        self.auth_mode != AuthMode::Off
    }

    /// Credential header as a typed name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the name is not a valid header.
    pub fn token_header(&self) -> AppResult<HeaderName> {
        HeaderName::from_bytes(self.auth_token_header.as_bytes()).map_err(|e| {
            AppError::ConfigError(format!(
                "Invalid AUTH_TOKEN_HEADER '{}': {e}",
                self.auth_token_header
            ))
        })
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_enabled()
            .then(|| SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }
}

/// Parse a variable into `T`, falling back to `default` when unset.
fn parse_var<F, T>(var: &F, name: &str, default: T) -> AppResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match var(name) {
        Some(val) => val
            .trim()
            .parse()
            .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
        None => Ok(default),
    }
}

/// Comma-separated list; an unset variable yields `default`, an empty one
/// an empty list.
fn list_var<F>(var: &F, name: &str, default: Vec<String>) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => default,
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 3000,
            // Rate limiting
            rate_limit_rate: 10.0,
            rate_limit_capacity: 20,
            rate_limit_key: RateLimitKey::Ip,
            bucket_idle_ttl: Duration::from_secs(600),
            bucket_sweep_interval: Duration::from_secs(60),
            // Deadline
            request_timeout: Duration::from_secs(30),
            abort_on_timeout: false,
            // Security
            auth_mode: AuthMode::Required,
            auth_bypass_paths: vec!["/health".to_string(), "/ping".to_string()],
            auth_token_header: "authorization".to_string(),
            auth_token_prefix: "Bearer".to_string(),
            auth_tokens: Vec::new(),
            cors_allowed_origins: vec!["*".to_string()],
            trusted_proxies: Vec::new(), // Empty = trust all (dev mode)
            // Fault handling
            recovery_expose_detail: false,
            // Observability
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            slow_request_threshold: Duration::from_millis(200),
            access_log_skip_paths: vec!["/health".to_string(), "/ping".to_string()],
            metrics_port: 0,
        }
    }
}
