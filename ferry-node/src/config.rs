//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::peer::RetryPolicy;
use crate::transport::TransportConfig;

/// Node configuration. File: `--config` path, ~/.config/ferry/config.toml or /etc/ferry/config.toml.
/// Env overrides: FERRY_LISTEN_HOST, FERRY_INBOUND_CAPACITY, FERRY_REQUEST_ATTEMPTS,
/// FERRY_RETRY_INTERVAL_MS, FERRY_DIAL_TIMEOUT_MS, FERRY_REQUEST_TTL_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Host part of the listen address; the port comes from the command line (default "localhost").
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    /// Capacity of the inbound message queue (default 1024).
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
    /// Send attempts per file request (default 5).
    #[serde(default = "default_request_attempts")]
    pub request_attempts: u32,
    /// Pause between failed attempts in milliseconds (default 2000).
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// How long a send waits for an outbound connection in milliseconds (default 5000).
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// Seconds an unanswered request is remembered before it is forgotten (default 300).
    #[serde(default = "default_request_ttl_secs")]
    pub request_ttl_secs: u64,
}

fn default_listen_host() -> String {
    "localhost".to_string()
}
fn default_inbound_capacity() -> usize {
    1024
}
fn default_request_attempts() -> u32 {
    5
}
fn default_retry_interval_ms() -> u64 {
    2000
}
fn default_dial_timeout_ms() -> u64 {
    5000
}
fn default_request_ttl_secs() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            inbound_capacity: default_inbound_capacity(),
            request_attempts: default_request_attempts(),
            retry_interval_ms: default_retry_interval_ms(),
            dial_timeout_ms: default_dial_timeout_ms(),
            request_ttl_secs: default_request_ttl_secs(),
        }
    }
}

impl Config {
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            inbound_capacity: self.inbound_capacity.max(1),
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.request_attempts.max(1),
            interval: Duration::from_millis(self.retry_interval_ms),
        }
    }

    pub fn request_ttl(&self) -> Duration {
        Duration::from_secs(self.request_ttl_secs.max(1))
    }

    fn apply_env(&mut self) {
        if let Ok(s) = std::env::var("FERRY_LISTEN_HOST") {
            if !s.is_empty() {
                self.listen_host = s;
            }
        }
        if let Ok(s) = std::env::var("FERRY_INBOUND_CAPACITY") {
            if let Ok(n) = s.parse::<usize>() {
                self.inbound_capacity = n;
            }
        }
        if let Ok(s) = std::env::var("FERRY_REQUEST_ATTEMPTS") {
            if let Ok(n) = s.parse::<u32>() {
                self.request_attempts = n;
            }
        }
        if let Ok(s) = std::env::var("FERRY_RETRY_INTERVAL_MS") {
            if let Ok(n) = s.parse::<u64>() {
                self.retry_interval_ms = n;
            }
        }
        if let Ok(s) = std::env::var("FERRY_DIAL_TIMEOUT_MS") {
            if let Ok(n) = s.parse::<u64>() {
                self.dial_timeout_ms = n;
            }
        }
        if let Ok(s) = std::env::var("FERRY_REQUEST_TTL_SECS") {
            if let Ok(n) = s.parse::<u64>() {
                self.request_ttl_secs = n;
            }
        }
    }
}

/// Error reading an explicitly named config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: merge default, then config file (if present), then env vars.
/// An explicit path must exist and parse; the well-known locations are best effort.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => load_file().unwrap_or_default(),
    };
    c.apply_env();
    Ok(c)
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/ferry/config.toml"));
    }
    out.push(PathBuf::from("/etc/ferry/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match read_file(&p) {
                Ok(c) => return Some(c),
                Err(e) => tracing::warn!(error = %e, "ignoring config file"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let c = Config::default();
        assert_eq!(c.listen_host, "localhost");
        assert_eq!(c.inbound_capacity, 1024);
        let retry = c.retry_policy();
        assert_eq!(retry.attempts, 5);
        assert_eq!(retry.interval, Duration::from_secs(2));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("request_attempts = 3\n").unwrap();
        assert_eq!(c.request_attempts, 3);
        assert_eq!(c.retry_interval_ms, 2000);
        assert_eq!(c.dial_timeout_ms, 5000);
        assert_eq!(c.request_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn explicit_path_must_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "dial_timeout_ms = \"soon\"\n").unwrap();
        assert!(matches!(load(Some(&path)), Err(ConfigError::Parse { .. })));
        let missing = dir.path().join("missing.toml");
        assert!(matches!(load(Some(&missing)), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn zero_attempts_clamped() {
        let c = Config {
            request_attempts: 0,
            inbound_capacity: 0,
            request_ttl_secs: 0,
            ..Config::default()
        };
        assert_eq!(c.retry_policy().attempts, 1);
        assert_eq!(c.transport().inbound_capacity, 1);
        assert_eq!(c.request_ttl(), Duration::from_secs(1));
    }
}
