//! Wire format and control-plane messages
//!
//! One place for everything that crosses a process boundary: the 8-byte
//! datagram header, the JSON command set spoken on the control WebSocket,
//! the bridge (audio) WebSocket messages, and the snapshot types pushed
//! to dashboards.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ProtocolError;

/// Datagram header length: `[id:4][seq:u16 BE][type:u16 BE]`
pub const HEADER_LEN: usize = 8;

/// Four-byte ASCII endpoint identifier, NUL-padded on the wire.
///
/// `"001"` is stored as `30 30 31 00`; trailing NULs are stripped for
/// display and JSON.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId([u8; 4]);

/// The control-plane-backed virtual endpoint ("dashboard")
pub const VIRTUAL_DEVICE: DeviceId = DeviceId(*b"DSH\0");

/// Identifier used by the server itself (heartbeat replies)
pub const SERVER_DEVICE: DeviceId = DeviceId(*b"SRVR");

impl DeviceId {
    /// Build an id from a label, truncating to 4 bytes and NUL-padding
    pub fn new(label: &str) -> Self {
        let mut raw = [0u8; 4];
        for (slot, byte) in raw.iter_mut().zip(label.bytes()) {
            *slot = byte;
        }
        Self(raw)
    }

    pub const fn from_bytes(raw: [u8; 4]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Label with trailing NULs stripped; non-ASCII bytes are replaced
    pub fn label(&self) -> String {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(4);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({:?})", self.label())
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(DeviceId::new(&label))
    }
}

/// Datagram packet kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Audio,
    Control,
    Heartbeat,
}

impl PacketType {
    pub fn from_wire(raw: u16) -> Result<Self, ProtocolError> {
        match raw {
            0x0001 => Ok(PacketType::Audio),
            0x0002 => Ok(PacketType::Control),
            0x0003 => Ok(PacketType::Heartbeat),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }

    pub fn to_wire(self) -> u16 {
        match self {
            PacketType::Audio => 0x0001,
            PacketType::Control => 0x0002,
            PacketType::Heartbeat => 0x0003,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketType::Audio => "audio",
            PacketType::Control => "control",
            PacketType::Heartbeat => "heartbeat",
        }
    }
}

/// A parsed datagram: header fields plus an opaque payload
#[derive(Debug, Clone)]
pub struct Packet {
    pub device_id: DeviceId,
    pub sequence: u16,
    pub packet_type: PacketType,
    pub payload: Bytes,
}

impl Packet {
    pub fn audio(device_id: DeviceId, sequence: u16, payload: Bytes) -> Self {
        Self {
            device_id,
            sequence,
            packet_type: PacketType::Audio,
            payload,
        }
    }

    /// Heartbeat reply sent by the server itself
    pub fn heartbeat_reply() -> Self {
        Self {
            device_id: SERVER_DEVICE,
            sequence: 0,
            packet_type: PacketType::Heartbeat,
            payload: Bytes::new(),
        }
    }

    /// Parse a datagram. The payload is copied out of the receive buffer.
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::TooShort(buf.len()));
        }
        let device_id = DeviceId::from_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let sequence = u16::from_be_bytes([buf[4], buf[5]]);
        let packet_type = PacketType::from_wire(u16::from_be_bytes([buf[6], buf[7]]))?;
        Ok(Self {
            device_id,
            sequence,
            packet_type,
            payload: Bytes::copy_from_slice(&buf[HEADER_LEN..]),
        })
    }

    /// Encode to wire bytes (header + payload)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_slice(self.device_id.as_bytes());
        buf.put_u16(self.sequence);
        buf.put_u16(self.packet_type.to_wire());
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Limited command set accepted inside 0x0002 control datagrams
#[derive(Debug, Clone, Deserialize)]
pub struct DatagramCommand {
    pub command: String,
    #[serde(default)]
    pub target: Option<DeviceId>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// One monitor entry per received datagram, batched toward dashboards
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketInfo {
    pub device_id: DeviceId,
    pub sequence: u16,
    pub packet_type: &'static str,
    pub size: usize,
}

/// Per-endpoint snapshot pushed to the control plane
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStats {
    pub device_id: DeviceId,
    pub address: Option<String>,
    pub online: bool,
    #[serde(rename = "virtual")]
    pub is_virtual: bool,
    pub uptime_seconds: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub loss_rate: f64,
    pub average_jitter_ms: f64,
}

/// Routing matrix row for one endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    pub online: bool,
    pub muted: bool,
    pub broadcast: bool,
    pub routes: Vec<DeviceId>,
    pub groups: Vec<String>,
}

/// Full routing matrix, keyed by endpoint id
pub type RoutingMatrix = BTreeMap<DeviceId, RouteStatus>;

/// Exportable routing configuration (runtime snapshot, nothing persisted)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingSnapshot {
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
    #[serde(default)]
    pub broadcast: Vec<DeviceId>,
    #[serde(default)]
    pub muted: Vec<DeviceId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    pub source: DeviceId,
    pub targets: Vec<DeviceId>,
}

/// Global counters snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatsSnapshot {
    pub packets_received: u64,
    pub packets_routed: u64,
    pub packets_dropped: u64,
    pub bytes_received: u64,
    pub bytes_transmitted: u64,
    pub uptime_seconds: u64,
}

/// Audio parameters advertised in `initial-state`; never interpreted here
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioParams {
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
    pub channels: u16,
    pub opus_bitrate: u32,
}

/// Pacer timing diagnostic, retained in a ring and surfaced on the bridge
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingViolation {
    pub kind: ViolationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    /// Milliseconds for the timing kinds, queue depth for buildup
    pub value: f64,
    pub severity: Severity,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    IntervalDrift,
    PacketInterval,
    QueueBuildup,
    HighLatency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

/// Pacer statistics for `audio_stats` / `timing_update`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PacerStats {
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub interval_min_ms: f64,
    pub interval_max_ms: f64,
    pub interval_avg_ms: f64,
    pub flows: Vec<FlowStats>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStats {
    pub source: DeviceId,
    pub target: DeviceId,
    pub depth: usize,
    pub sent: u64,
    pub dropped: u64,
    /// Milliseconds since this flow last released a packet
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_ms: Option<u64>,
}

/// Commands accepted on the control WebSocket
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    GetDevices,
    GetRoutes,
    GetStats,
    SetRoute { source: DeviceId, target: DeviceId },
    RemoveRoute { source: DeviceId, target: DeviceId },
    CreateBidirectional { device_a: DeviceId, device_b: DeviceId },
    EnableBroadcast { device_id: DeviceId },
    DisableBroadcast { device_id: DeviceId },
    MuteDevice { device_id: DeviceId },
    UnmuteDevice { device_id: DeviceId },
    ApplyScenario { scenario: String },
    ExportConfig,
    ImportConfig { config: RoutingSnapshot },
    Ping,
}

/// Events pushed on the control WebSocket
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    InitialState {
        devices: Vec<DeviceStats>,
        routing: RoutingMatrix,
        stats: ServerStatsSnapshot,
        audio: AudioParams,
    },
    Devices {
        devices: Vec<DeviceStats>,
    },
    Routes {
        routing: RoutingMatrix,
    },
    Stats {
        stats: ServerStatsSnapshot,
    },
    DeviceConnected {
        device: DeviceStats,
    },
    DeviceReconnected {
        device: DeviceStats,
    },
    DeviceDisconnected {
        device_id: DeviceId,
    },
    RouteCreated {
        source: DeviceId,
        target: DeviceId,
    },
    RouteRemoved {
        source: DeviceId,
        target: DeviceId,
    },
    BidirectionalCreated {
        device_a: DeviceId,
        device_b: DeviceId,
    },
    ConfigExport {
        config: RoutingSnapshot,
    },
    Packets {
        packets: Vec<PacketInfo>,
    },
    Error {
        message: String,
    },
    Pong,
}

/// Messages accepted on the bridge (audio) WebSocket
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BridgeCommand {
    AudioPacket {
        #[serde(default = "virtual_device")]
        from: DeviceId,
        to: DeviceId,
        sequence: u16,
        opus: String,
        #[serde(default)]
        timestamp: u64,
    },
    StartListening {
        device_id: DeviceId,
    },
    StopListening {
        device_id: DeviceId,
    },
    RequestStats,
    SetRoute {
        source: DeviceId,
        target: DeviceId,
    },
}

fn virtual_device() -> DeviceId {
    VIRTUAL_DEVICE
}

/// Messages pushed on the bridge (audio) WebSocket
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BridgeEvent {
    Connected {
        device_id: DeviceId,
    },
    AudioReceived {
        from: DeviceId,
        sequence: u16,
        opus: String,
        timestamp: u64,
    },
    AudioStats {
        stats: PacerStats,
    },
    ListeningStarted {
        device_id: DeviceId,
    },
    ListeningStopped {
        device_id: DeviceId,
    },
    TimingUpdate {
        stats: PacerStats,
    },
    TimingViolation {
        violation: TimingViolation,
    },
    Error {
        message: String,
    },
}
