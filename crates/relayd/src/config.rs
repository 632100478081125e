//! Daemon configuration.
//!
//! Values come from three layers, lowest precedence first:
//! built-in defaults, an optional TOML file, then command-line flags and
//! environment variables (applied by the binary).
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 3010
//! mode = "tls"
//! tls_cert = "/etc/relay/cert.pem"
//! tls_key = "/etc/relay/key.pem"
//! event_buffer = 256
//! submit_timeout_ms = 1000
//! write_timeout_ms = 5000
//! max_frame_size = 1048576
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::router::RouterConfig;

/// Default listen port
pub const DEFAULT_PORT: u16 = 3010;

/// Default maximum inbound frame size (1 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1_048_576;

/// Whether the listener speaks plaintext HTTP or TLS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServeMode {
    #[default]
    Plain,
    Tls,
}

impl FromStr for ServeMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" | "http" => Ok(ServeMode::Plain),
            "tls" | "https" => Ok(ServeMode::Tls),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

impl fmt::Display for ServeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServeMode::Plain => f.write_str("plain"),
            ServeMode::Tls => f.write_str("tls"),
        }
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    pub host: IpAddr,
    pub port: u16,
    pub mode: ServeMode,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub event_buffer: usize,
    pub submit_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub max_frame_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let router = RouterConfig::default();
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            mode: ServeMode::Plain,
            tls_cert: None,
            tls_key: None,
            event_buffer: router.event_buffer,
            submit_timeout_ms: duration_ms(router.submit_timeout),
            write_timeout_ms: duration_ms(router.write_timeout),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

fn parse_toml(contents: &str, origin: &str) -> Result<RelayConfig, ConfigError> {
    toml::from_str(contents).map_err(|e| ConfigError::Parse {
        origin: origin.to_string(),
        error: e.to_string(),
    })
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl RelayConfig {
    /// Loads a configuration from a TOML file. Missing keys keep their
    /// defaults; unknown keys are rejected.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        parse_toml(&contents, &path.display().to_string())
    }

    /// Parses a configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        parse_toml(contents, "<inline>")
    }

    /// Checks the configuration for values the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode == ServeMode::Tls {
            if self.tls_cert.is_none() {
                return Err(ConfigError::MissingTlsPath { which: "certificate" });
            }
            if self.tls_key.is_none() {
                return Err(ConfigError::MissingTlsPath { which: "key" });
            }
        }

        for (field, value) in [
            ("event_buffer", self.event_buffer as u64),
            ("submit_timeout_ms", self.submit_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("max_frame_size", self.max_frame_size as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroValue { field });
            }
        }

        Ok(())
    }

    /// Address the listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Router settings derived from this configuration.
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            event_buffer: self.event_buffer,
            submit_timeout: self.submit_timeout(),
            write_timeout: self.write_timeout(),
        }
    }
}

/// Errors loading or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config {origin}: {error}")]
    Parse { origin: String, error: String },

    #[error("Invalid serve mode '{0}' (expected 'plain' or 'tls')")]
    InvalidMode(String),

    #[error("TLS mode requires a {which} path")]
    MissingTlsPath { which: &'static str },

    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },
}
