//! WolfMesh Configuration
//!
//! This module provides configuration structures for the WolfMesh
//! tunnel bridge. Every field has a default, so an empty file (or no file
//! at all) yields a working node.

use serde::{Deserialize, Serialize};
use std::net::{Ipv6Addr, SocketAddr};
use std::time::Duration;

use crate::bridge::FallbackPolicy;
use crate::mesh::LinkConfig;
use crate::tun::{MAX_MTU, MIN_MTU};

/// Main WolfMesh configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WolfMeshConfig {
    /// Tunnel interface configuration
    pub tun: TunConfig,

    /// Mesh transport configuration
    pub mesh: MeshConfig,

    /// LAN peer discovery configuration
    pub discovery: DiscoveryConfig,

    /// Address to key cache configuration
    pub cache: CacheConfig,

    /// Status API configuration
    pub api: ApiConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Loop restart configuration
    pub supervisor: SupervisorConfig,
}

/// Tunnel interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunConfig {
    /// Interface name; "none" runs without a tunnel
    #[serde(default = "default_tun_name")]
    pub name: String,

    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

/// Mesh transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Address the link acceptor listens on (port 0 = ephemeral)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Depth of the transport's receive and per-link send queues
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Link handshake timeout in milliseconds
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

/// LAN peer discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Enable multicast announcements and the listener
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// IPv6 multicast group
    #[serde(default = "default_multicast_group")]
    pub group: Ipv6Addr,

    /// Multicast UDP port
    #[serde(default = "default_discovery_port")]
    pub port: u16,

    /// Announcement interval in milliseconds
    #[serde(default = "default_announce_interval_ms")]
    pub interval_ms: u64,

    /// Interfaces to announce on (empty = default interface)
    #[serde(default)]
    pub interfaces: Vec<String>,

    /// Timeout for connecting to a discovered peer, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Address to key cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Lifetime of a learned key in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    /// Interval between expiry sweeps in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Maximum cached addresses (0 = unbounded)
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// What to do with packets for addresses with no cached key
    #[serde(default)]
    pub fallback: FallbackPolicy,
}

/// Status API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP status API
    #[serde(default)]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Loop restart configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Restart a loop after it fails
    #[serde(default = "default_true")]
    pub restart: bool,

    /// Restarts allowed per loop (0 = unlimited)
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Delay before a restart in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

// Default value functions
fn default_tun_name() -> String {
    "wolfmesh0".to_string()
}

fn default_mtu() -> usize {
    1500
}

fn default_listen_address() -> String {
    "[::]:0".to_string()
}

fn default_queue_depth() -> usize {
    1024
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

fn default_multicast_group() -> Ipv6Addr {
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x114)
}

fn default_discovery_port() -> u16 {
    9602
}

fn default_announce_interval_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    10
}

fn default_max_entries() -> usize {
    65536
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "127.0.0.1:9603".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_max_restarts() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    1000
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: default_tun_name(),
            mtu: default_mtu(),
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            queue_depth: default_queue_depth(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: default_multicast_group(),
            port: default_discovery_port(),
            interval_ms: default_announce_interval_ms(),
            interfaces: Vec::new(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_entries: default_max_entries(),
            fallback: FallbackPolicy::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart: true,
            max_restarts: default_max_restarts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl DiscoveryConfig {
    /// Get announcement interval as Duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Get peer connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl WolfMeshConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfMeshConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfMeshConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.tun.name.is_empty() {
            return Err(crate::Error::Config("tun.name cannot be empty (use \"none\" to disable)".into()));
        }

        if self.tun_enabled() && !(MIN_MTU..=MAX_MTU).contains(&self.tun.mtu) {
            return Err(crate::Error::Config(format!(
                "tun.mtu must be between {} and {}, got {}",
                MIN_MTU, MAX_MTU, self.tun.mtu
            )));
        }

        self.listen_address()?;

        if self.mesh.queue_depth == 0 {
            return Err(crate::Error::Config("mesh.queue_depth must be positive".into()));
        }

        if self.discovery.enabled {
            if !self.discovery.group.is_multicast() {
                return Err(crate::Error::Config(format!(
                    "discovery.group {} is not a multicast address",
                    self.discovery.group
                )));
            }
            if self.discovery.interval_ms == 0 {
                return Err(crate::Error::Config("discovery.interval_ms must be positive".into()));
            }
        }

        if self.cache.ttl_secs == 0 || self.cache.sweep_interval_secs == 0 {
            return Err(crate::Error::Config("cache.ttl_secs and cache.sweep_interval_secs must be positive".into()));
        }

        if self.api.enabled {
            self.api_address()?;
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "logging.format must be \"pretty\" or \"compact\", got \"{}\"",
                    other
                )))
            }
        }

        Ok(())
    }

    /// Whether a tunnel interface should be created
    pub fn tun_enabled(&self) -> bool {
        self.tun.name != "none"
    }

    /// Parsed link acceptor address
    pub fn listen_address(&self) -> crate::Result<SocketAddr> {
        self.mesh
            .listen_address
            .parse()
            .map_err(|e| crate::Error::Config(format!("mesh.listen_address '{}': {}", self.mesh.listen_address, e)))
    }

    /// Parsed status API address
    pub fn api_address(&self) -> crate::Result<SocketAddr> {
        self.api
            .bind_address
            .parse()
            .map_err(|e| crate::Error::Config(format!("api.bind_address '{}': {}", self.api.bind_address, e)))
    }

    /// Link transport settings
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            queue_depth: self.mesh.queue_depth,
            handshake_timeout: Duration::from_millis(self.mesh.handshake_timeout_ms),
        }
    }

    /// Get cache TTL as Duration
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    /// Get cache sweep interval as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = WolfMeshConfig::from_str("").unwrap();
        assert_eq!(config.tun.name, "wolfmesh0");
        assert_eq!(config.tun.mtu, 1500);
        assert_eq!(config.discovery.port, 9602);
        assert_eq!(config.discovery.group, "ff02::114".parse::<Ipv6Addr>().unwrap());
        assert_eq!(config.cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.cache.fallback, FallbackPolicy::PrefixGuess);
        assert!(!config.api.enabled);
        assert!(config.tun_enabled());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[tun]
name = "mesh0"
mtu = 1400

[mesh]
listen_address = "[::]:9600"

[discovery]
interfaces = ["eth0", "wlan0"]
interval_ms = 5000

[cache]
ttl_secs = 120
fallback = "drop"

[api]
enabled = true
bind_address = "127.0.0.1:8080"

[logging]
format = "compact"
"#;

        let config = WolfMeshConfig::from_str(toml).unwrap();
        assert_eq!(config.tun.name, "mesh0");
        assert_eq!(config.listen_address().unwrap().port(), 9600);
        assert_eq!(config.discovery.interfaces.len(), 2);
        assert_eq!(config.discovery.interval(), Duration::from_secs(5));
        assert_eq!(config.cache.fallback, FallbackPolicy::Drop);
        assert_eq!(config.cache_ttl(), Duration::from_secs(120));
        assert_eq!(config.api_address().unwrap().port(), 8080);
    }

    #[test]
    fn test_tun_none_disables_tunnel() {
        let config = WolfMeshConfig::from_str("[tun]\nname = \"none\"\nmtu = 0\n").unwrap();
        assert!(!config.tun_enabled());
    }

    #[test]
    fn test_validation_errors() {
        assert!(WolfMeshConfig::from_str("[mesh]\nlisten_address = \"nowhere\"\n").is_err());
        assert!(WolfMeshConfig::from_str("[discovery]\ngroup = \"fd00::1\"\n").is_err());
        assert!(WolfMeshConfig::from_str("[logging]\nformat = \"json\"\n").is_err());
        assert!(WolfMeshConfig::from_str("[cache]\nfallback = \"shrug\"\n").is_err());
        assert!(WolfMeshConfig::from_str("[tun]\nmtu = 576\n").is_err());
    }

    #[test]
    fn test_mtu_must_fit_packet_buffers() {
        let err = WolfMeshConfig::from_str("[tun]\nname = \"mesh0\"\nmtu = 9000\n").unwrap_err();
        assert!(err.to_string().contains("tun.mtu"));
        assert!(WolfMeshConfig::from_str("[tun]\nmtu = 2045\n").is_err());

        let config = WolfMeshConfig::from_str("[tun]\nmtu = 2044\n").unwrap();
        assert_eq!(config.tun.mtu, MAX_MTU);
    }
}
