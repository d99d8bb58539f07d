//! Client and discovery configuration.
//!
//! Configuration is assembled in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if loaded via [`ClientConfig::from_file`])
//! 3. Environment variables (`COMFOCONNECT_*`)
//! 4. Builder methods

use crate::error::ConfigError;
use comfoconnect_protocol::{parse_uuid, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Client UUID used when none is configured.
pub const DEFAULT_CLIENT_UUID: &str = "20200428000000000000000009080408";

/// Device name announced at registration when none is configured.
pub const DEFAULT_DEVICE_NAME: &str = "comfoconnect-rs";

/// Default keep-alive interval (30 s).
pub const DEFAULT_KEEP_ALIVE_MS: u64 = 30_000;

/// Minimum keep-alive interval (5 s).
pub const MIN_KEEP_ALIVE_MS: u64 = 5_000;

/// Default per-request timeout (15 s).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

/// Default TCP connect timeout (10 s).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default overall discovery timeout (30 s).
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 30_000;

/// Interval between discovery broadcasts (2 s).
pub const DEFAULT_BROADCAST_INTERVAL_MS: u64 = 2_000;

fn default_client_uuid() -> Uuid {
    Uuid::parse_str(DEFAULT_CLIENT_UUID).unwrap_or_default()
}

/// Connection and session configuration for one gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Gateway host name or IP address.
    pub address: String,
    /// Gateway TCP port.
    pub port: u16,
    /// Gateway UUID.
    #[serde(with = "uuid_hex")]
    pub device_uuid: Uuid,
    /// UUID this client registers under.
    #[serde(with = "uuid_hex")]
    pub client_uuid: Uuid,
    /// Registration PIN.
    pub pin: u32,
    /// Name announced at registration.
    pub device_name: String,
    /// Keep-alive interval in milliseconds.
    pub keep_alive_ms: u64,
    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: DEFAULT_PORT,
            device_uuid: Uuid::nil(),
            client_uuid: default_client_uuid(),
            pin: 0,
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            keep_alive_ms: DEFAULT_KEEP_ALIVE_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl ClientConfig {
    pub fn new(address: impl Into<String>, device_uuid: Uuid) -> Self {
        Self {
            address: address.into(),
            device_uuid,
            ..Self::default()
        }
    }

    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let mut config: ClientConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `COMFOCONNECT_*` overrides read through `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(address) = lookup("COMFOCONNECT_ADDRESS") {
            self.address = address;
        }

        if let Some(port) = lookup("COMFOCONNECT_PORT").and_then(|v| v.parse().ok()) {
            self.port = port;
        }

        if let Some(uuid) = lookup("COMFOCONNECT_UUID").and_then(|v| parse_uuid(&v).ok()) {
            self.device_uuid = uuid;
        }

        if let Some(uuid) = lookup("COMFOCONNECT_CLIENT_UUID").and_then(|v| parse_uuid(&v).ok()) {
            self.client_uuid = uuid;
        }

        if let Some(pin) = lookup("COMFOCONNECT_PIN").and_then(|v| v.parse().ok()) {
            self.pin = pin;
        }

        if let Some(name) = lookup("COMFOCONNECT_DEVICE_NAME") {
            self.device_name = name;
        }

        if let Some(ms) = lookup("COMFOCONNECT_KEEP_ALIVE_MS").and_then(|v| v.parse().ok()) {
            self.keep_alive_ms = ms;
        }

        if let Some(ms) = lookup("COMFOCONNECT_REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.request_timeout_ms = ms;
        }
    }

    /// Checks that the gateway address and UUID are set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "address",
                message: "gateway address is required".to_string(),
            });
        }
        if self.device_uuid.is_nil() {
            return Err(ConfigError::InvalidValue {
                field: "device_uuid",
                message: "gateway UUID is required".to_string(),
            });
        }
        Ok(())
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_client_uuid(mut self, uuid: Uuid) -> Self {
        self.client_uuid = uuid;
        self
    }

    pub fn with_pin(mut self, pin: u32) -> Self {
        self.pin = pin;
        self
    }

    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Sets the keep-alive interval, raised to the 5 s floor if lower.
    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_ms = (interval.as_millis() as u64).max(MIN_KEEP_ALIVE_MS);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Returns the keep-alive interval, never below the floor.
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms.max(MIN_KEEP_ALIVE_MS))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Addresses the discovery request is broadcast to.
    pub broadcast_addresses: Vec<IpAddr>,
    /// Gateway discovery port.
    pub port: u16,
    /// Local address the UDP socket binds to.
    pub bind_addr: SocketAddr,
    /// Overall discovery timeout in milliseconds.
    pub timeout_ms: u64,
    /// Interval between broadcasts in milliseconds.
    pub broadcast_interval_ms: u64,
    /// Stop after this many distinct gateways.
    pub limit: Option<usize>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            broadcast_addresses: vec![IpAddr::V4(Ipv4Addr::BROADCAST)],
            port: DEFAULT_PORT,
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            broadcast_interval_ms: DEFAULT_BROADCAST_INTERVAL_MS,
            limit: None,
        }
    }
}

impl DiscoveryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broadcast_addresses(mut self, addresses: Vec<IpAddr>) -> Self {
        self.broadcast_addresses = addresses;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_broadcast_interval(mut self, interval: Duration) -> Self {
        self.broadcast_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms.max(1))
    }
}

/// (De)serializes UUIDs as bare hex, accepting short zero-padded values.
mod uuid_hex {
    use comfoconnect_protocol::{format_uuid, parse_uuid};
    use serde::{Deserialize, Deserializer, Serializer};
    use uuid::Uuid;

    pub fn serialize<S: Serializer>(uuid: &Uuid, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_uuid(uuid))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Uuid, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_uuid(&text).map_err(serde::de::Error::custom)
    }
}
