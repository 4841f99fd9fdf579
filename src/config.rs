//! Bridge configuration.
//!
//! Resolution order (later wins):
//! 1. Built-in defaults (`localhost:8081`, 5s connect, 120s per request,
//!    bare JSON framing as the CAD plugin expects)
//! 2. `<config_dir>/cadbridge/config.toml`, if present
//! 3. `CADBRIDGE_*` environment variables
//!
//! The binary applies its command-line flags on top.
//!
//! ```toml
//! host = "localhost"
//! port = 8081
//! connect_timeout_ms = 5000
//! request_timeout_secs = 120
//! framing = "json"            # or "content-length" for peers that send headers
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::ipc::Framing;

/// Default peer host.
pub const DEFAULT_HOST: &str = "localhost";

/// Default peer port agreed with the CAD-side plugin.
pub const DEFAULT_PORT: u16 = 8081;

/// Ceiling for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-request watchdog.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Host and port of the peer. Immutable for the life of a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for PeerAddress {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Runtime configuration for a [`TransportClient`](crate::ipc::TransportClient)
/// and the [`ConnectionManager`](crate::ipc::ConnectionManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub peer: PeerAddress,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub framing: Framing,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            peer: PeerAddress::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            framing: Framing::default(),
        }
    }
}

/// On-disk form of the configuration. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    host: Option<String>,
    port: Option<u16>,
    connect_timeout_ms: Option<u64>,
    request_timeout_secs: Option<u64>,
    framing: Option<Framing>,
}

/// Resolve the default config file path.
///
/// `$XDG_CONFIG_HOME/cadbridge/config.toml` on Linux,
/// `~/Library/Application Support/cadbridge/config.toml` on macOS.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("cadbridge").join("config.toml"))
}

impl BridgeConfig {
    /// Configuration for the given peer with default timeouts.
    pub fn for_peer(peer: PeerAddress) -> Self {
        Self {
            peer,
            ..Self::default()
        }
    }

    /// Load defaults, then the config file (if any), then the environment.
    pub fn load() -> Result<Self, BridgeError> {
        let mut config = Self::default();

        if let Some(path) = default_config_path() {
            if path.exists() {
                config.merge_file(&path)?;
                tracing::debug!("Loaded configuration from {}", path.display());
            }
        }

        config.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Merge settings from a TOML file.
    pub fn merge_file(&mut self, path: &Path) -> Result<(), BridgeError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        self.merge_toml(&content)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Merge settings from TOML text.
    pub fn merge_toml(&mut self, content: &str) -> Result<(), BridgeError> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| BridgeError::Config(e.to_string()))?;

        if let Some(host) = file.host {
            self.peer.host = host;
        }
        if let Some(port) = file.port {
            self.peer.port = port;
        }
        if let Some(ms) = file.connect_timeout_ms {
            self.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = file.request_timeout_secs {
            self.request_timeout = Duration::from_secs(secs);
        }
        if let Some(framing) = file.framing {
            self.framing = framing;
        }
        Ok(())
    }

    /// Apply `CADBRIDGE_*` overrides read through `get`.
    ///
    /// Taking a lookup function keeps this testable without touching the
    /// process environment.
    pub fn apply_env_with<F>(&mut self, get: F) -> Result<(), BridgeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = get("CADBRIDGE_HOST") {
            self.peer.host = host;
        }
        if let Some(port) = get("CADBRIDGE_PORT") {
            self.peer.port = parse_env("CADBRIDGE_PORT", &port)?;
        }
        if let Some(ms) = get("CADBRIDGE_CONNECT_TIMEOUT_MS") {
            self.connect_timeout =
                Duration::from_millis(parse_env("CADBRIDGE_CONNECT_TIMEOUT_MS", &ms)?);
        }
        if let Some(secs) = get("CADBRIDGE_REQUEST_TIMEOUT_SECS") {
            self.request_timeout =
                Duration::from_secs(parse_env("CADBRIDGE_REQUEST_TIMEOUT_SECS", &secs)?);
        }
        if let Some(framing) = get("CADBRIDGE_FRAMING") {
            self.framing = parse_env("CADBRIDGE_FRAMING", &framing)?;
        }
        Ok(())
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T, BridgeError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| BridgeError::Config(format!("Invalid {} value '{}': {}", key, value, e)))
}
