//! Application configuration
//!
//! Loaded from a TOML file; every section has working defaults so a
//! missing or partial file still yields a runnable server.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub udp: UdpConfig,
    pub audio: AudioConfig,
    pub device: DeviceConfig,
    pub routing: RoutingConfig,
    pub websocket: WebSocketConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Datagram socket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Bind port for the datagram socket
    pub server_port: u16,
    /// Base local port for simulator-side bindings; unused by the server
    pub device_port_start: u16,
    /// MTU guard for reads
    pub max_packet_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            server_port: DEFAULT_UDP_PORT,
            device_port_start: DEFAULT_UDP_PORT + 1,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

/// Audio parameters. Only `frame_duration` is interpreted (jitter
/// accounting); the rest is advertised to clients verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Nominal inter-packet interval in milliseconds
    pub frame_duration: u32,
    pub channels: u16,
    pub opus_bitrate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_duration: PACKET_INTERVAL_MS as u32,
            channels: DEFAULT_CHANNELS,
            opus_bitrate: DEFAULT_BITRATE,
        }
    }
}

/// Endpoint lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Registry capacity bound
    pub max_devices: usize,
    /// Seconds of silence before an endpoint is marked offline
    pub timeout_seconds: u64,
    /// Heartbeat cadence hint for clients; not enforced by the server
    pub heartbeat_interval: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            max_devices: MAX_DEVICES,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            heartbeat_interval: 5,
        }
    }
}

/// Routing policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Initial routing mode label, advertised only
    pub default_mode: String,
    /// Conference/group cardinality bound
    pub max_group_size: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_mode: "manual".to_string(),
            max_group_size: MAX_GROUP_SIZE,
        }
    }
}

/// Control/bridge channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Port for the control and bridge WebSocket endpoints
    pub port: u16,
    /// Keepalive ping cadence in seconds
    pub ping_interval: u64,
    /// Bind address for the listener
    pub bind_address: String,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_WS_PORT,
            ping_interval: DEFAULT_PING_INTERVAL_SECS,
            bind_address: "0.0.0.0".to_string(),
        }
    }
}
