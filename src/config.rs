use crate::error::{ProbeError, Result};
use crate::proxy::CheckerConfig;
use std::env;
use std::time::Duration;

/// Smallest and largest accepted per-probe timeout in seconds
pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 60;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Defaults applied to every run
    pub probe: ProbeDefaults,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (default: 127.0.0.1)
    pub host: String,
    /// Port to listen on (default: 3000)
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct ProbeDefaults {
    /// Concurrent lanes per run
    pub workers: usize,
    /// Per-probe timeout in seconds
    pub timeout_secs: u64,
    /// URL fetched through every proxy
    pub test_url: String,
    /// Failures faster than this many milliseconds are reported without latency
    pub fast_fail_ms: u64,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Config {
            server: ServerConfig {
                host: get_env_or("PROBE_HOST", "127.0.0.1"),
                port: get_env_or("PROBE_PORT", "3000").parse().map_err(|_| {
                    ProbeError::InvalidConfig("PROBE_PORT must be a valid port number".into())
                })?,
            },
            probe: ProbeDefaults {
                workers: get_env_or("PROBE_WORKERS", "10").parse().map_err(|_| {
                    ProbeError::InvalidConfig("PROBE_WORKERS must be a valid number".into())
                })?,
                timeout_secs: get_env_or("PROBE_TIMEOUT", "10").parse().map_err(|_| {
                    ProbeError::InvalidConfig("PROBE_TIMEOUT must be a number of seconds".into())
                })?,
                test_url: get_env_or("PROBE_TEST_URL", "http://httpbin.org/ip"),
                fast_fail_ms: get_env_or("PROBE_FAST_FAIL_MS", "100").parse().map_err(|_| {
                    ProbeError::InvalidConfig("PROBE_FAST_FAIL_MS must be a valid number".into())
                })?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that parsing alone does not cover
    pub fn validate(&self) -> Result<()> {
        if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&self.probe.timeout_secs) {
            return Err(ProbeError::InvalidConfig(format!(
                "timeout must be between {} and {} seconds",
                MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS
            )));
        }
        if self.probe.test_url.is_empty() {
            return Err(ProbeError::InvalidConfig("test URL must not be empty".into()));
        }
        if !matches!(self.log.format.as_str(), "json" | "pretty") {
            return Err(ProbeError::InvalidConfig(format!(
                "LOG_FORMAT must be json or pretty, got {}",
                self.log.format
            )));
        }
        Ok(())
    }

    /// Get the server bind address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Checker configuration built from the run defaults
    pub fn checker_config(&self) -> CheckerConfig {
        CheckerConfig::new()
            .with_workers(self.probe.workers)
            .with_timeout(Duration::from_secs(self.probe.timeout_secs))
            .with_test_url(self.probe.test_url.clone())
            .with_fast_fail_threshold(Duration::from_millis(self.probe.fast_fail_ms))
    }
}

fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Clamp a requested timeout into the accepted range
pub fn clamp_timeout_secs(secs: u64) -> u64 {
    secs.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS)
}
