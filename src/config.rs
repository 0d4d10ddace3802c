//! Configuration for the archive shipper.
//!
//! Every setting has a default and can be overridden through environment
//! variables; command-line flags are applied on top by the binary (see
//! [`crate::cli`]). The values are validated once, after all layers are
//! merged.

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::batch::{BatchScope, FlushPolicy, DEFAULT_BATCH_BYTES};
use crate::filter::{MemberFilter, DEFAULT_COMPONENTS, DEFAULT_EXTENSION};

/// Default Seq CLEF ingestion endpoint
pub const DEFAULT_URL: &str = "http://localhost:9341/api/events/raw?clef";

/// Default HTTP request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Largest accepted byte threshold for one batch
const MAX_BATCH_BYTES: usize = 50_000_000;

/// Largest accepted line count for one batch
const MAX_BATCH_LINES: usize = 1_000_000;

pub const ENV_URL: &str = "ARCHIVE_SHIPPER_URL";
pub const ENV_BATCH_BYTES: &str = "ARCHIVE_SHIPPER_BATCH_BYTES";
pub const ENV_BATCH_LINES: &str = "ARCHIVE_SHIPPER_BATCH_LINES";
pub const ENV_BATCH_SCOPE: &str = "ARCHIVE_SHIPPER_BATCH_SCOPE";
pub const ENV_COMPONENTS: &str = "ARCHIVE_SHIPPER_COMPONENTS";
pub const ENV_EXTENSION: &str = "ARCHIVE_SHIPPER_EXTENSION";
pub const ENV_REQUIRE_TIMESTAMP: &str = "ARCHIVE_SHIPPER_REQUIRE_TIMESTAMP";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "ARCHIVE_SHIPPER_REQUEST_TIMEOUT_SECS";
pub const ENV_MAX_RETRIES: &str = "ARCHIVE_SHIPPER_MAX_RETRIES";

/// Fully resolved configuration for a shipping run.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Ingestion endpoint receiving each batch as a POST body
    pub url: String,

    /// When accumulated payloads are flushed into a batch
    pub flush_policy: FlushPolicy,

    /// Whether batches are cut at member boundaries
    pub batch_scope: BatchScope,

    /// Substrings marking a member as coming from a shipped component
    pub components: Vec<String>,

    /// Required member name suffix
    pub extension: String,

    /// Only ship envelopes carrying an `@t` field
    pub require_timestamp: bool,

    /// HTTP request timeout duration
    pub request_timeout: Duration,

    /// Retries on transport failures before the run is aborted
    pub max_retries: u32,
}

/// Error type for configuration loading failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting has an unusable value
    #[error("Configuration error for {var}: {message}")]
    Invalid { var: String, message: String },
}

impl ConfigError {
    pub fn invalid(var: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            var: var.to_string(),
            message: message.into(),
        }
    }

    /// Setting the error is about.
    pub fn var(&self) -> &str {
        match self {
            ConfigError::Invalid { var, .. } => var,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ConfigError::Invalid { message, .. } => message,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Unset variables fall back to the defaults of [`Config::default`].
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set to a value that does not
    /// parse or falls outside its accepted range.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use archive_shipper::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Shipping to {}", config.url);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = read_var(ENV_URL) {
            config.url = url;
        }

        if let Some(bytes) = read_var(ENV_BATCH_BYTES) {
            config.flush_policy = FlushPolicy::Bytes(parse_number(ENV_BATCH_BYTES, &bytes)?);
        }

        // A line count selects the line policy and wins over a byte threshold.
        if let Some(lines) = read_var(ENV_BATCH_LINES) {
            config.flush_policy = FlushPolicy::Lines(parse_number(ENV_BATCH_LINES, &lines)?);
        }

        if let Some(scope) = read_var(ENV_BATCH_SCOPE) {
            config.batch_scope = parse_scope(ENV_BATCH_SCOPE, &scope)?;
        }

        if let Some(components) = read_var(ENV_COMPONENTS) {
            config.components = components
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(extension) = read_var(ENV_EXTENSION) {
            config.extension = extension;
        }

        if let Some(flag) = read_var(ENV_REQUIRE_TIMESTAMP) {
            config.require_timestamp = parse_bool(ENV_REQUIRE_TIMESTAMP, &flag)?;
        }

        if let Some(secs) = read_var(ENV_REQUEST_TIMEOUT_SECS) {
            config.request_timeout =
                Duration::from_secs(parse_number(ENV_REQUEST_TIMEOUT_SECS, &secs)?);
        }

        if let Some(retries) = read_var(ENV_MAX_RETRIES) {
            config.max_retries = parse_number(ENV_MAX_RETRIES, &retries)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints and value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::invalid(ENV_URL, "URL must not be empty"));
        }

        match self.flush_policy {
            FlushPolicy::Bytes(bytes) => check_range(ENV_BATCH_BYTES, bytes, MAX_BATCH_BYTES)?,
            FlushPolicy::Lines(lines) => check_range(ENV_BATCH_LINES, lines, MAX_BATCH_LINES)?,
        }

        if self.components.is_empty() {
            return Err(ConfigError::invalid(
                ENV_COMPONENTS,
                "at least one component name is required",
            ));
        }

        // An empty name would be contained in every member name.
        if self.components.iter().any(|c| c.trim().is_empty()) {
            return Err(ConfigError::invalid(
                ENV_COMPONENTS,
                "component names must not be empty",
            ));
        }

        if self.extension.is_empty() {
            return Err(ConfigError::invalid(ENV_EXTENSION, "extension must not be empty"));
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::invalid(
                ENV_REQUEST_TIMEOUT_SECS,
                "timeout must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Member filter built from the component and extension settings.
    pub fn member_filter(&self) -> MemberFilter {
        MemberFilter::new(self.components.iter().cloned(), self.extension.clone())
    }
}

impl Default for Config {
    /// Defaults matching a local Seq instance and the control/compute logs of
    /// a test run.
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            flush_policy: FlushPolicy::Bytes(DEFAULT_BATCH_BYTES),
            batch_scope: BatchScope::PerMember,
            components: DEFAULT_COMPONENTS.iter().map(|c| c.to_string()).collect(),
            extension: DEFAULT_EXTENSION.to_string(),
            require_timestamp: false,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_retries: 0,
        }
    }
}

fn read_var(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parse_number<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(var, format!("'{}' is not a valid number", value)))
}

fn check_range(var: &str, value: usize, max: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(var, "value must be greater than 0"));
    }
    if value > max {
        return Err(ConfigError::invalid(
            var,
            format!("value {} exceeds maximum allowed ({})", value, max),
        ));
    }
    Ok(())
}

/// Parse `member` or `run`.
pub fn parse_scope(var: &str, value: &str) -> Result<BatchScope, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "member" => Ok(BatchScope::PerMember),
        "run" => Ok(BatchScope::PerRun),
        other => Err(ConfigError::invalid(
            var,
            format!("'{}' is not a batch scope (expected 'member' or 'run')", other),
        )),
    }
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(var, format!("'{}' is not a boolean", value))),
    }
}
