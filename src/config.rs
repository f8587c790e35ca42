//! Daemon configuration, read once at startup from the environment.

use std::path::PathBuf;
use std::time::Duration;

/// Parsed configuration with `Duration`/`PathBuf` fields, mirroring the
/// env-var table in §6.
#[derive(Debug, Clone)]
pub struct Config {
    pub registry_path: PathBuf,
    pub max_output_length: usize,
    pub default_session_ttl: Duration,
    pub max_session_ttl: Duration,
    pub cleanup_interval: Duration,
    pub bind_addr: String,

    pub start_timeout: Duration,
    pub exec_timeout: Duration,
    pub stop_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry_path: PathBuf::from("/app/containers/registry.yaml"),
            max_output_length: 10_000,
            default_session_ttl: Duration::from_secs(300),
            max_session_ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(30),
            bind_addr: "0.0.0.0:8080".to_string(),
            start_timeout: Duration::from_secs(60),
            exec_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Build from environment variables, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            registry_path: std::env::var("REGISTRY_PATH")
                .ok()
                .map(PathBuf::from)
                .unwrap_or(defaults.registry_path),
            max_output_length: env_usize("MAX_OUTPUT_LENGTH", defaults.max_output_length),
            default_session_ttl: env_seconds("DEFAULT_SESSION_TTL", defaults.default_session_ttl),
            max_session_ttl: env_seconds("MAX_SESSION_TTL", defaults.max_session_ttl),
            cleanup_interval: env_seconds("CLEANUP_INTERVAL", defaults.cleanup_interval),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            ..defaults
        }
    }

    /// Clamp a requested TTL into `[0, max_session_ttl]`.
    pub fn clamp_ttl(&self, requested: Option<u64>) -> Duration {
        let seconds = requested.unwrap_or_else(|| self.default_session_ttl.as_secs());
        Duration::from_secs(seconds).min(self.max_session_ttl)
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_seconds(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
