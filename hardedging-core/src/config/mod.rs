//! Configuration management
//!
//! Defaults, TOML files and `HARDEDGING_<SECTION>_<KEY>` environment overrides,
//! validated before use. Every section is `#[serde(default)]`, so a file only
//! needs the keys it changes.

use serde::{Deserialize, Serialize};
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::core_mesh::admission::{AdmissionConfig, QueuePolicy};
use crate::logging::LogLevel;

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rendezvous: RendezvousConfig,
    pub node: NodeConfig,
    pub admission: AdmissionConfig,
    pub transport: TransportConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Rendezvous relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    pub bind_address: SocketAddr,

    /// Connections beyond this are closed right after the upgrade
    pub max_connections: usize,

    /// WebSocket path peers connect to
    pub signal_path: String,
}

/// Mesh participant configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Relay endpoint; `http(s)://` is rewritten to `ws(s)://`
    pub rendezvous_url: String,

    pub room_id: String,

    /// How long a local asset request waits for any peer to answer
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Sessions that have not opened a channel by then are closed
    #[serde(with = "humantime_serde")]
    pub negotiation_timeout: Duration,

    /// Largest payload this node seeds or accepts from a peer
    pub max_asset_size_bytes: usize,

    /// Ask the mesh before the origin
    pub p2p_first: bool,

    /// Capacity of the node's command and event channels
    pub channel_capacity: usize,
}

/// Peer link (TCP transport) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address offer listeners bind to
    pub listen_host: IpAddr,

    /// Address advertised in candidates, when it differs from `listen_host`
    pub advertise_host: Option<IpAddr>,

    pub max_frame_size: usize,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    pub json_format: bool,
    pub with_timestamp: bool,
    pub with_target: bool,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Install the Prometheus exporter
    pub enabled: bool,
    pub bind_address: SocketAddr,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 4000)),
            max_connections: 10_000,
            signal_path: "/signal".to_string(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rendezvous_url: "ws://127.0.0.1:4000/signal".to_string(),
            room_id: "default".to_string(),
            request_timeout: Duration::from_secs(5),
            negotiation_timeout: Duration::from_secs(15),
            max_asset_size_bytes: 10 * 1024 * 1024, // 10 MiB
            p2p_first: true,
            channel_capacity: 256,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            advertise_host: None,
            max_frame_size: 16 * 1024 * 1024, // 16 MiB
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: SocketAddr::from((Ipv4Addr::LOCALHOST, 9090)),
        }
    }
}

impl NodeConfig {
    /// The WebSocket URL to dial, with the scheme normalized to `ws`/`wss`
    pub fn signal_url(&self) -> String {
        if let Some(rest) = self.rendezvous_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.rendezvous_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.rendezvous_url.clone()
        }
    }
}

/// Parse `raw` into `target`, tagging failures with the variable name.
fn parse_into<T>(key: &str, raw: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    *target = raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    Ok(())
}

fn parse_duration_into(key: &str, raw: &str, target: &mut Duration) -> Result<(), ConfigError> {
    *target = humantime_serde::re::humantime::parse_duration(raw.trim()).map_err(|e| {
        ConfigError::InvalidValue { key: key.to_string(), reason: e.to_string() }
    })?;
    Ok(())
}

impl Config {
    /// Load configuration from environment variables on top of the defaults
    ///
    /// Variables follow the pattern `HARDEDGING_<SECTION>_<KEY>`, e.g.
    /// `HARDEDGING_NODE_ROOM_ID=lobby`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;

        let config: Self = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Apply process environment overrides
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the process environment in production)
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        const BIND: &str = "HARDEDGING_RENDEZVOUS_BIND_ADDRESS";
        const MAX_CONN: &str = "HARDEDGING_RENDEZVOUS_MAX_CONNECTIONS";
        const URL: &str = "HARDEDGING_NODE_RENDEZVOUS_URL";
        const ROOM: &str = "HARDEDGING_NODE_ROOM_ID";
        const TIMEOUT: &str = "HARDEDGING_NODE_REQUEST_TIMEOUT";
        const NEGOTIATION: &str = "HARDEDGING_NODE_NEGOTIATION_TIMEOUT";
        const MAX_ASSET: &str = "HARDEDGING_NODE_MAX_ASSET_SIZE_BYTES";
        const P2P_FIRST: &str = "HARDEDGING_NODE_P2P_FIRST";
        const MAX_CONCURRENT: &str = "HARDEDGING_ADMISSION_MAX_CONCURRENT_PER_ASSET";
        const POLICY: &str = "HARDEDGING_ADMISSION_QUEUE_POLICY";
        const MAX_QUEUE: &str = "HARDEDGING_ADMISSION_MAX_QUEUE_SIZE";
        const LISTEN_HOST: &str = "HARDEDGING_TRANSPORT_LISTEN_HOST";
        const ADVERTISE_HOST: &str = "HARDEDGING_TRANSPORT_ADVERTISE_HOST";
        const LOG_LEVEL: &str = "HARDEDGING_LOG_LEVEL";
        const LOG_JSON: &str = "HARDEDGING_LOG_JSON";
        const METRICS_ENABLED: &str = "HARDEDGING_METRICS_ENABLED";
        const METRICS_BIND: &str = "HARDEDGING_METRICS_BIND_ADDRESS";

        // Rendezvous
        if let Some(v) = lookup(BIND) {
            parse_into(BIND, &v, &mut self.rendezvous.bind_address)?;
        }
        if let Some(v) = lookup(MAX_CONN) {
            parse_into(MAX_CONN, &v, &mut self.rendezvous.max_connections)?;
        }

        // Node
        if let Some(v) = lookup(URL) {
            self.node.rendezvous_url = v;
        }
        if let Some(v) = lookup(ROOM) {
            self.node.room_id = v;
        }
        if let Some(v) = lookup(TIMEOUT) {
            parse_duration_into(TIMEOUT, &v, &mut self.node.request_timeout)?;
        }
        if let Some(v) = lookup(NEGOTIATION) {
            parse_duration_into(NEGOTIATION, &v, &mut self.node.negotiation_timeout)?;
        }
        if let Some(v) = lookup(MAX_ASSET) {
            parse_into(MAX_ASSET, &v, &mut self.node.max_asset_size_bytes)?;
        }
        if let Some(v) = lookup(P2P_FIRST) {
            parse_into(P2P_FIRST, &v, &mut self.node.p2p_first)?;
        }

        // Admission
        if let Some(v) = lookup(MAX_CONCURRENT) {
            parse_into(MAX_CONCURRENT, &v, &mut self.admission.max_concurrent_per_asset)?;
        }
        if let Some(v) = lookup(POLICY) {
            let mut policy = QueuePolicy::default();
            parse_into(POLICY, &v, &mut policy)?;
            self.admission.queue_policy = policy;
        }
        if let Some(v) = lookup(MAX_QUEUE) {
            parse_into(MAX_QUEUE, &v, &mut self.admission.max_queue_size)?;
        }

        // Transport
        if let Some(v) = lookup(LISTEN_HOST) {
            parse_into(LISTEN_HOST, &v, &mut self.transport.listen_host)?;
        }
        if let Some(v) = lookup(ADVERTISE_HOST) {
            let mut host = self.transport.listen_host;
            parse_into(ADVERTISE_HOST, &v, &mut host)?;
            self.transport.advertise_host = Some(host);
        }

        // Logging
        if let Some(v) = lookup(LOG_LEVEL) {
            self.logging.level = v;
        }
        if let Some(v) = lookup(LOG_JSON) {
            parse_into(LOG_JSON, &v, &mut self.logging.json_format)?;
        }

        // Metrics
        if let Some(v) = lookup(METRICS_ENABLED) {
            parse_into(METRICS_ENABLED, &v, &mut self.metrics.enabled)?;
        }
        if let Some(v) = lookup(METRICS_BIND) {
            parse_into(METRICS_BIND, &v, &mut self.metrics.bind_address)?;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rendezvous.max_connections == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        if !self.rendezvous.signal_path.starts_with('/') {
            return Err(ConfigError::ValidationFailed(
                "signal_path must start with '/'".to_string(),
            ));
        }

        let url = self.node.rendezvous_url.as_str();
        if !["ws://", "wss://", "http://", "https://"].iter().any(|s| url.starts_with(s)) {
            return Err(ConfigError::ValidationFailed(format!(
                "rendezvous_url must be a ws(s):// or http(s):// URL: {}",
                url
            )));
        }
        if self.node.room_id.trim().is_empty() {
            return Err(ConfigError::ValidationFailed("room_id must not be empty".to_string()));
        }
        if self.node.request_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "request_timeout must be greater than 0".to_string(),
            ));
        }
        if self.node.max_asset_size_bytes == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_asset_size_bytes must be greater than 0".to_string(),
            ));
        }
        if self.node.channel_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "channel_capacity must be greater than 0".to_string(),
            ));
        }

        if self.admission.max_concurrent_per_asset == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_per_asset must be greater than 0".to_string(),
            ));
        }

        // A whole asset travels as one base64 JSON frame.
        let encoded_max = self.node.max_asset_size_bytes.div_ceil(3) * 4 + 1024;
        if self.transport.max_frame_size < encoded_max {
            return Err(ConfigError::ValidationFailed(format!(
                "max_frame_size ({}) cannot carry a max-size asset ({} bytes encoded)",
                self.transport.max_frame_size, encoded_max
            )));
        }

        if self.logging.level.parse::<LogLevel>().is_err() {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents = self.to_toml()?;
        let path = path.as_ref();
        std::fs::write(path, contents)
            .map_err(|source| ConfigError::Write { path: path.to_path_buf(), source })?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
