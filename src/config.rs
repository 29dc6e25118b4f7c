use serde::{Deserialize, Serialize};
use std::env;
use std::sync::RwLock;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

/// Global configuration instance, lazily populated from the environment.
static CONFIG: RwLock<Option<Config>> = RwLock::new(None);

/// Agent configuration, populated from environment variables with defaults
/// for everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Self identity string sent as `host` in every request.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Server host/port this endpoint talks to.
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Buffer capacity `CAP` (entries). Must be >= 2.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// `MAX_AGE`: seconds a non-full buffer may sit before a forced flush.
    #[serde(default = "default_buffer_send")]
    pub buffer_send_secs: u64,

    /// Refresh period for `getActiveChecks`.
    #[serde(default = "default_refresh")]
    pub refresh_active_checks_secs: u64,

    /// Default `maxLinesPerSecond` for log/logrt/eventlog checks that omit it.
    #[serde(default = "default_max_lines_per_second")]
    pub max_lines_per_second: u32,

    /// Per-connection timeout.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Optional source IP to bind outgoing connections to.
    #[serde(default)]
    pub source_ip: Option<String>,
}

/// Rate-cap clamp bounds.
impl Config {
    pub const MIN_LINES_PER_SECOND: u32 = 1;
    pub const MAX_LINES_PER_SECOND_CAP: u32 = 1000;

    pub fn clamp_lines_per_second(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.max_lines_per_second)
            .clamp(Self::MIN_LINES_PER_SECOND, Self::MAX_LINES_PER_SECOND_CAP)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn buffer_send(&self) -> Duration {
        Duration::from_secs(self.buffer_send_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_active_checks_secs)
    }
}

fn default_hostname() -> String {
    "unregistered".to_string()
}
fn default_server_host() -> String {
    "127.0.0.1".to_string()
}
fn default_server_port() -> u16 {
    10051
}
fn default_buffer_size() -> usize {
    100
}
fn default_buffer_send() -> u64 {
    5
}
fn default_refresh() -> u64 {
    120
}
fn default_max_lines_per_second() -> u32 {
    20
}
fn default_timeout() -> u64 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Config {
            hostname: default_hostname(),
            server_host: default_server_host(),
            server_port: default_server_port(),
            buffer_size: default_buffer_size(),
            buffer_send_secs: default_buffer_send(),
            refresh_active_checks_secs: default_refresh(),
            max_lines_per_second: default_max_lines_per_second(),
            timeout_secs: default_timeout(),
            source_ip: None,
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults.
    pub fn load() -> CoreResult<Self> {
        Ok(Self::from_env(Self::default()))
    }

    /// Apply environment variable overrides onto a base configuration.
    pub fn from_env(mut config: Config) -> Self {
        if let Ok(v) = env::var("HOSTNAME") {
            if !v.is_empty() {
                config.hostname = v;
            }
        }
        if let Ok(v) = env::var("SERVER_HOST") {
            if !v.is_empty() {
                config.server_host = v;
            }
        }
        if let Ok(v) = env::var("SERVER_PORT") {
            if let Ok(p) = v.parse::<u16>() {
                config.server_port = p;
            }
        }
        if let Ok(v) = env::var("BUFFER_SIZE") {
            if let Ok(n) = v.parse::<usize>() {
                config.buffer_size = n.max(2);
            }
        }
        if let Ok(v) = env::var("BUFFER_SEND") {
            if let Ok(secs) = v.parse::<u64>() {
                config.buffer_send_secs = secs;
            }
        }
        if let Ok(v) = env::var("REFRESH_ACTIVE_CHECKS") {
            if let Ok(secs) = v.parse::<u64>() {
                config.refresh_active_checks_secs = secs;
            }
        }
        if let Ok(v) = env::var("MAX_LINES_PER_SECOND") {
            if let Ok(n) = v.parse::<u32>() {
                config.max_lines_per_second =
                    n.clamp(Self::MIN_LINES_PER_SECOND, Self::MAX_LINES_PER_SECOND_CAP);
            }
        }
        if let Ok(v) = env::var("TIMEOUT") {
            if let Ok(secs) = v.parse::<u64>() {
                config.timeout_secs = secs;
            }
        }
        if let Ok(v) = env::var("SOURCE_IP") {
            if !v.is_empty() {
                config.source_ip = Some(v);
            }
        }

        config
    }

    /// Get the global configuration instance, initializing it on first use.
    pub fn global() -> CoreResult<Config> {
        let guard = CONFIG
            .read()
            .map_err(|e| CoreError::Internal(format!("config lock poisoned: {e}")))?;

        if let Some(ref config) = *guard {
            Ok(config.clone())
        } else {
            drop(guard);
            Self::initialize()
        }
    }

    /// Initialize the global configuration from the environment.
    pub fn initialize() -> CoreResult<Config> {
        let config = Self::load()?;

        let mut guard = CONFIG
            .write()
            .map_err(|e| CoreError::Internal(format!("config lock poisoned: {e}")))?;

        *guard = Some(config.clone());
        Ok(config)
    }

    /// Replace the global configuration (used by tests and hot reload).
    #[allow(dead_code)]
    pub fn update(config: Config) -> CoreResult<()> {
        let mut guard = CONFIG
            .write()
            .map_err(|e| CoreError::Internal(format!("config lock poisoned: {e}")))?;

        *guard = Some(config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.buffer_size, 100);
        assert_eq!(config.refresh_active_checks_secs, 120);
        assert_eq!(config.max_lines_per_second, 20);
    }

    #[test]
    fn test_env_overrides_do_not_touch_process_env() {
        let mut base = Config::default();
        base.buffer_size = 4;
        // from_env only reads env vars that happen to be set; absent vars
        // leave the base value untouched.
        let merged = Config::from_env(base.clone());
        assert_eq!(merged.buffer_size, base.buffer_size);
    }

    #[test]
    fn test_clamp_lines_per_second() {
        let config = Config::default();
        assert_eq!(config.clamp_lines_per_second(None), 20);
        assert_eq!(config.clamp_lines_per_second(Some(5000)), 1000);
        assert_eq!(config.clamp_lines_per_second(Some(0)), 1);
    }

    #[test]
    fn test_duration_helpers() {
        let config = Config::default();
        assert_eq!(config.timeout(), Duration::from_secs(3));
        assert_eq!(config.buffer_send(), Duration::from_secs(5));
    }
}
