//! Configuration module for the Log Analytics forwarder.
//!
//! This module provides environment-based configuration: workspace
//! credentials, process-wide labels, batching window, HTTP timeouts and
//! circuit breaker tuning.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;

/// Default batch size (number of events per batch)
const DEFAULT_BATCH_SIZE: usize = 100;

/// Default flush window in milliseconds
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1_000;

/// Maximum allowed batch size to bound request payloads
const MAX_BATCH_SIZE: usize = 10_000;

/// Minimum flush window to prevent a busy flush loop
const MIN_FLUSH_INTERVAL_MS: u64 = 10;

/// Maximum flush window to ensure reasonable data freshness
const MAX_FLUSH_INTERVAL_MS: u64 = 300_000;

/// Default TCP connect timeout in milliseconds
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;

/// Default response read timeout in milliseconds
const DEFAULT_READ_TIMEOUT_MS: u64 = 5_000;

/// Upper bound for either HTTP timeout
const MAX_TIMEOUT_MS: u64 = 600_000;

/// Data collector API version expected by the endpoint
pub const API_VERSION: &str = "2016-04-01";

/// Build the ingestion URL for a workspace.
pub fn workspace_ingest_url(workspace_id: &str) -> String {
    format!(
        "https://{}.ods.opinsights.azure.com/api/logs?api-version={}",
        workspace_id, API_VERSION
    )
}

/// Credentials of the target Log Analytics workspace.
#[derive(Clone, PartialEq, Eq)]
pub struct WorkspaceCredentials {
    pub workspace_id: String,

    /// Base64 encoded primary (shared) key
    pub workspace_key: String,
}

impl std::fmt::Debug for WorkspaceCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceCredentials")
            .field("workspace_id", &self.workspace_id)
            .field("workspace_key", &"<redacted>")
            .finish()
    }
}

/// Process-wide labels appended to every event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationConfig {
    pub server_name: Option<String>,
    pub region_name: Option<String>,
}

impl ApplicationConfig {
    pub fn new(server_name: impl AsRef<str>, region_name: impl AsRef<str>) -> Self {
        Self {
            server_name: non_blank(server_name.as_ref()),
            region_name: non_blank(region_name.as_ref()),
        }
    }
}

/// Configuration for the forwarder.
///
/// All settings can be configured via environment variables:
/// - `LOG_ANALYTICS_WORKSPACE_ID`: Workspace id (delivery disabled if unset)
/// - `LOG_ANALYTICS_PRIMARY_KEY`: Base64 workspace key (delivery disabled if unset)
/// - `LOG_ANALYTICS_SERVER_NAME` / `LOG_ANALYTICS_REGION_NAME`: Labels added to events
/// - `LOG_ANALYTICS_INGEST_URL`: Override of the ingestion URL
/// - `LOG_ANALYTICS_BATCH_SIZE`: Events per batch (default: 100)
/// - `LOG_ANALYTICS_FLUSH_INTERVAL_MS`: Batching window (default: 1000)
/// - `LOG_ANALYTICS_CONNECT_TIMEOUT_MS` / `LOG_ANALYTICS_READ_TIMEOUT_MS`: HTTP timeouts (default: 2000 / 5000)
/// - `LOG_ANALYTICS_BREAKER_*`: Circuit breaker tuning, see [`CircuitBreakerConfig`]
#[derive(Debug, Clone)]
pub struct Config {
    pub workspace_id: Option<String>,

    pub workspace_key: Option<String>,

    /// Labels merged into every event before it is queued
    pub application: ApplicationConfig,

    /// Replaces the workspace ingestion URL when set
    pub ingest_url_override: Option<String>,

    /// Maximum number of events released in one batch
    pub batch_size: usize,

    /// Maximum time an event waits in the buffer before its batch is flushed
    pub flush_interval: Duration,

    pub connect_timeout: Duration,

    pub read_timeout: Duration,

    pub circuit_breaker: CircuitBreakerConfig,
}

/// Error type for configuration loading failures
#[derive(Debug, Clone, thiserror::Error)]
#[error("Configuration error{}: {message}", var_suffix(.env_var))]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

fn var_suffix(env_var: &Option<String>) -> String {
    env_var
        .as_ref()
        .map(|var| format!(" for {}", var))
        .unwrap_or_default()
}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a numeric variable does not parse or is out
    /// of range. Missing credentials are not an error: they disable delivery.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use log_analytics_forwarder::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("delivery enabled: {}", config.credentials().is_some());
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).and_then(|v| non_blank(&v));

        let application = ApplicationConfig {
            server_name: text("LOG_ANALYTICS_SERVER_NAME"),
            region_name: text("LOG_ANALYTICS_REGION_NAME"),
        };

        let batch_size = parse_number(
            &lookup,
            "LOG_ANALYTICS_BATCH_SIZE",
            DEFAULT_BATCH_SIZE,
            1,
            MAX_BATCH_SIZE,
        )?;

        let flush_interval_ms = parse_number(
            &lookup,
            "LOG_ANALYTICS_FLUSH_INTERVAL_MS",
            DEFAULT_FLUSH_INTERVAL_MS,
            MIN_FLUSH_INTERVAL_MS,
            MAX_FLUSH_INTERVAL_MS,
        )?;

        let connect_timeout_ms = parse_number(
            &lookup,
            "LOG_ANALYTICS_CONNECT_TIMEOUT_MS",
            DEFAULT_CONNECT_TIMEOUT_MS,
            1,
            MAX_TIMEOUT_MS,
        )?;

        let read_timeout_ms = parse_number(
            &lookup,
            "LOG_ANALYTICS_READ_TIMEOUT_MS",
            DEFAULT_READ_TIMEOUT_MS,
            1,
            MAX_TIMEOUT_MS,
        )?;

        let circuit_breaker = Self::parse_circuit_breaker(&lookup)?;

        Ok(Self {
            workspace_id: text("LOG_ANALYTICS_WORKSPACE_ID"),
            workspace_key: text("LOG_ANALYTICS_PRIMARY_KEY"),
            application,
            ingest_url_override: text("LOG_ANALYTICS_INGEST_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
            batch_size,
            flush_interval: Duration::from_millis(flush_interval_ms),
            connect_timeout: Duration::from_millis(connect_timeout_ms),
            read_timeout: Duration::from_millis(read_timeout_ms),
            circuit_breaker,
        })
    }

    fn parse_circuit_breaker<F>(lookup: &F) -> Result<CircuitBreakerConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = CircuitBreakerConfig::default();

        let rate_var = "LOG_ANALYTICS_BREAKER_FAILURE_RATE";
        let failure_rate_threshold = match lookup(rate_var) {
            Some(value) => {
                let rate: f64 = value.trim().parse().map_err(|_| {
                    ConfigError::for_var(rate_var, format!("'{}' is not a valid number", value))
                })?;
                if !(rate > 0.0 && rate <= 1.0) {
                    return Err(ConfigError::for_var(
                        rate_var,
                        format!("failure rate {} must be in (0, 1]", rate),
                    ));
                }
                rate
            }
            None => defaults.failure_rate_threshold,
        };

        let sliding_window_size = parse_number(
            lookup,
            "LOG_ANALYTICS_BREAKER_WINDOW",
            defaults.sliding_window_size,
            1,
            10_000,
        )?;

        let minimum_calls = parse_number(
            lookup,
            "LOG_ANALYTICS_BREAKER_MIN_CALLS",
            defaults.minimum_calls.min(sliding_window_size),
            1,
            sliding_window_size,
        )?;

        let cooldown_secs = parse_number(
            lookup,
            "LOG_ANALYTICS_BREAKER_COOLDOWN_SECS",
            defaults.cooldown.as_secs(),
            1,
            86_400,
        )?;

        let half_open_calls = parse_number(
            lookup,
            "LOG_ANALYTICS_BREAKER_HALF_OPEN_CALLS",
            defaults.half_open_calls,
            1,
            1_000,
        )?;

        Ok(CircuitBreakerConfig {
            failure_rate_threshold,
            sliding_window_size,
            minimum_calls,
            cooldown: Duration::from_secs(cooldown_secs),
            half_open_calls,
        })
    }

    /// Credentials for remote delivery.
    ///
    /// `None` unless both the workspace id and key are configured. Without
    /// credentials every event goes to the fallback sink for the process
    /// lifetime.
    pub fn credentials(&self) -> Option<WorkspaceCredentials> {
        match (&self.workspace_id, &self.workspace_key) {
            (Some(workspace_id), Some(workspace_key)) => Some(WorkspaceCredentials {
                workspace_id: workspace_id.clone(),
                workspace_key: workspace_key.clone(),
            }),
            _ => None,
        }
    }

    /// URL the batches are posted to, if delivery is possible.
    pub fn ingest_url(&self) -> Option<String> {
        match (&self.ingest_url_override, &self.workspace_id) {
            (Some(url), _) => Some(url.clone()),
            (None, Some(workspace_id)) => Some(workspace_ingest_url(workspace_id)),
            (None, None) => None,
        }
    }

    /// Set the workspace credentials.
    pub fn with_credentials(
        mut self,
        workspace_id: impl Into<String>,
        workspace_key: impl Into<String>,
    ) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self.workspace_key = Some(workspace_key.into());
        self
    }

    /// Set the process-wide labels.
    pub fn with_application(mut self, application: ApplicationConfig) -> Self {
        self.application = application;
        self
    }
}

/// Parse a numeric variable with range validation, defaulting when unset.
fn parse_number<T, F>(lookup: &F, env_var: &str, default: T, min: T, max: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Display + Copy,
    F: Fn(&str) -> Option<String>,
{
    let value = match lookup(env_var) {
        Some(value) => value,
        None => return Ok(default),
    };

    let parsed: T = value.trim().parse().map_err(|_| {
        ConfigError::for_var(env_var, format!("'{}' is not a valid number", value))
    })?;

    if parsed < min {
        return Err(ConfigError::for_var(
            env_var,
            format!("value {} is below minimum ({})", parsed, min),
        ));
    }

    if parsed > max {
        return Err(ConfigError::for_var(
            env_var,
            format!("value {} exceeds maximum ({})", parsed, max),
        ));
    }

    Ok(parsed)
}

impl Default for Config {
    /// Defaults with no credentials, i.e. fallback-only delivery.
    fn default() -> Self {
        Self {
            workspace_id: None,
            workspace_key: None,
            application: ApplicationConfig::default(),
            ingest_url_override: None,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}
