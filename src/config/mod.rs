//! Configuration management for gatefleet
//!
//! Configuration is loaded from `GATEFLEET_*` environment variables or a TOML
//! file. Every section has defaults, so a file only needs the keys it
//! overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Upper bound for the alert cooldown and orphan grace windows (ten years)
pub const MAX_WINDOW_SECS: u64 = 10 * 365 * 24 * 3600;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub remote: RemoteConfig,
    pub reconcile: ReconcileConfig,
    pub placement: PlacementConfig,
    pub free_tier: FreeTierConfig,
    pub server: ServerConfig,
    pub alerts: AlertsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database path
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/gatefleet.db"),
        }
    }
}

/// Node control channel behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    /// Total attempts per call, first try included
    pub max_attempts: u32,

    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval_secs: u64,

    /// Minimum time between two alerts for the same (target, kind)
    pub alert_cooldown_secs: u64,

    /// Age a remote credential must reach before the reverse sweep deletes it
    pub orphan_grace_secs: u64,

    /// Clear bans held against moderators and administrators
    pub auto_unban_privileged: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            alert_cooldown_secs: 3600,
            orphan_grace_secs: 900,
            auto_unban_privileged: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Let roles with the over-capacity capability place onto full nodes
    pub allow_over_capacity_for_privileged: bool,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            allow_over_capacity_for_privileged: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FreeTierConfig {
    pub quota_gb: u64,
    pub duration_days: u32,
}

impl Default for FreeTierConfig {
    fn default() -> Self {
        Self {
            quota_gb: 100,
            duration_days: 365,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,

    /// Required `x-api-key` header value, if set
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: String::from("0.0.0.0:8080"),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub webhook_url: Option<String>,
    pub webhook_token: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        let config = Self {
            database: DatabaseConfig {
                path: env_opt("GATEFLEET_DB_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(d.database.path),
            },
            remote: RemoteConfig {
                timeout_secs: env_or("GATEFLEET_REMOTE_TIMEOUT", d.remote.timeout_secs),
                max_attempts: env_or("GATEFLEET_REMOTE_MAX_ATTEMPTS", d.remote.max_attempts),
                base_delay_ms: env_or("GATEFLEET_REMOTE_BASE_DELAY_MS", d.remote.base_delay_ms),
                max_delay_ms: env_or("GATEFLEET_REMOTE_MAX_DELAY_MS", d.remote.max_delay_ms),
            },
            reconcile: ReconcileConfig {
                interval_secs: env_or("GATEFLEET_RECONCILE_INTERVAL", d.reconcile.interval_secs),
                alert_cooldown_secs: env_or(
                    "GATEFLEET_ALERT_COOLDOWN",
                    d.reconcile.alert_cooldown_secs,
                ),
                orphan_grace_secs: env_or("GATEFLEET_ORPHAN_GRACE", d.reconcile.orphan_grace_secs),
                auto_unban_privileged: env_or(
                    "GATEFLEET_AUTO_UNBAN_PRIVILEGED",
                    d.reconcile.auto_unban_privileged,
                ),
            },
            placement: PlacementConfig {
                allow_over_capacity_for_privileged: env_or(
                    "GATEFLEET_ALLOW_OVER_CAPACITY",
                    d.placement.allow_over_capacity_for_privileged,
                ),
            },
            free_tier: FreeTierConfig {
                quota_gb: env_or("GATEFLEET_FREE_QUOTA_GB", d.free_tier.quota_gb),
                duration_days: env_or("GATEFLEET_FREE_DURATION_DAYS", d.free_tier.duration_days),
            },
            server: ServerConfig {
                bind_address: env_opt("GATEFLEET_BIND_ADDRESS").unwrap_or(d.server.bind_address),
                api_key: env_opt("GATEFLEET_API_KEY"),
            },
            alerts: AlertsConfig {
                webhook_url: env_opt("GATEFLEET_ALERT_WEBHOOK_URL"),
                webhook_token: env_opt("GATEFLEET_ALERT_WEBHOOK_TOKEN"),
            },
            logging: LoggingConfig {
                level: env_opt("GATEFLEET_LOG_LEVEL").unwrap_or(d.logging.level),
                format: env_opt("GATEFLEET_LOG_FORMAT").unwrap_or(d.logging.format),
            },
        };

        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::with_source(format!("Failed to read config file: {}", path.display()), e)
        })?;

        toml::from_str(&content).map_err(|e| {
            Error::config(format!(
                "Failed to parse TOML config file {}: {e}",
                path.display()
            ))
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.remote.timeout_secs == 0 {
            return Err(Error::config("remote.timeout_secs must be greater than 0"));
        }

        if self.remote.max_attempts == 0 {
            return Err(Error::config("remote.max_attempts must be greater than 0"));
        }

        if self.remote.base_delay_ms > self.remote.max_delay_ms {
            return Err(Error::config(
                "remote.base_delay_ms must not exceed remote.max_delay_ms",
            ));
        }

        if self.reconcile.interval_secs == 0 {
            return Err(Error::config("reconcile.interval_secs must be greater than 0"));
        }

        if self.reconcile.alert_cooldown_secs == 0 {
            return Err(Error::config(
                "reconcile.alert_cooldown_secs must be greater than 0",
            ));
        }

        if self.reconcile.alert_cooldown_secs > MAX_WINDOW_SECS
            || self.reconcile.orphan_grace_secs > MAX_WINDOW_SECS
        {
            return Err(Error::config(format!(
                "reconcile.alert_cooldown_secs and reconcile.orphan_grace_secs must not exceed {MAX_WINDOW_SECS}"
            )));
        }

        if self.free_tier.quota_gb == 0 || self.free_tier.duration_days == 0 {
            return Err(Error::config("free tier quota and duration must be positive"));
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(Error::config(format!(
                "logging.format must be 'text' or 'json', got '{}'",
                self.logging.format
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile.interval_secs)
    }

    #[must_use]
    pub fn alert_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reconcile.alert_cooldown_secs.min(MAX_WINDOW_SECS) as i64)
    }

    #[must_use]
    pub fn orphan_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reconcile.orphan_grace_secs.min(MAX_WINDOW_SECS) as i64)
    }
}
