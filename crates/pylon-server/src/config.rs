//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (PYLON_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use pylon_core::{BreakerConfig, FailurePolicy, LimiterConfig, Quota};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Admission and rate limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Circuit breaker settings per dependency.
    #[serde(default)]
    pub breaker: BreakersConfig,

    /// Policy when the shared store is unavailable during a rate decision.
    #[serde(default = "default_failure_policy")]
    pub failure_policy: FailurePolicy,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Admission and rate-limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum live connections per identity.
    #[serde(default = "default_max_connections_per_identity")]
    pub max_connections_per_identity: u32,

    /// Per-identity message quota.
    #[serde(default)]
    pub messages: QuotaConfig,
}

/// A rate quota for one scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Maximum events per window.
    #[serde(default = "default_message_limit")]
    pub limit: u32,

    /// Window length in seconds.
    #[serde(default = "default_message_window")]
    pub window_secs: u64,

    /// Optional burst cap below the limit.
    #[serde(default)]
    pub burst: Option<u32>,
}

/// Circuit breaker settings for both protected dependencies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakersConfig {
    /// Breaker for the identity provider.
    #[serde(default)]
    pub identity: BreakerSettings,

    /// Breaker for the shared store.
    #[serde(default)]
    pub store: BreakerSettings,
}

/// Settings for one circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_fail_max")]
    pub fail_max: u32,

    /// Milliseconds spent open before a trial call.
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_ms: u64,

    /// Upper bound on each guarded call in milliseconds.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("PYLON_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("PYLON_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_failure_policy() -> FailurePolicy {
    FailurePolicy::Open
}

fn default_max_connections_per_identity() -> u32 {
    10
}

fn default_message_limit() -> u32 {
    120
}

fn default_message_window() -> u64 {
    60
}

fn default_fail_max() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    30_000
}

fn default_call_timeout() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            websocket_path: default_ws_path(),
            limits: LimitsConfig::default(),
            breaker: BreakersConfig::default(),
            failure_policy: default_failure_policy(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections_per_identity: default_max_connections_per_identity(),
            messages: QuotaConfig::default(),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            limit: default_message_limit(),
            window_secs: default_message_window(),
            burst: None,
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            fail_max: default_fail_max(),
            recovery_timeout_ms: default_recovery_timeout(),
            call_timeout_ms: default_call_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl BreakerSettings {
    /// Convert to the core breaker configuration.
    #[must_use]
    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            fail_max: self.fail_max,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }
}

impl QuotaConfig {
    /// Convert to a limiter quota.
    #[must_use]
    pub fn to_quota(&self) -> Quota {
        Quota {
            limit: self.limit,
            window: Duration::from_secs(self.window_secs),
            burst: self.burst,
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "pylon.toml",
            "/etc/pylon/pylon.toml",
            "~/.config/pylon/pylon.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .expect("Invalid host:port")
    }

    /// Limiter configuration derived from the limits section.
    #[must_use]
    pub fn limiter_config(&self) -> LimiterConfig {
        LimiterConfig {
            policy: self.failure_policy,
            max_connections_per_identity: self.limits.max_connections_per_identity,
        }
    }
}
