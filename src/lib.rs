//! # LAN Audio Fabric
//!
//! Real-time audio exchange fabric for small endpoints: embedded devices
//! send compressed audio frames over UDP at a fixed cadence, the fabric
//! replicates each frame to zero or more destinations under an
//! operator-controlled routing policy, and browser operators steer the
//! whole thing over WebSockets.
//!
//! ```text
//!  ┌──────────┐  UDP frames  ┌──────────────────────────────────────┐
//!  │ Device A │─────────────▶│              UdpServer               │
//!  └──────────┘              │   parse ─▶ registry ─▶ routing       │
//!  ┌──────────┐              │                  │                   │
//!  │ Device B │◀─────────────│    direct egress │ paced egress      │
//!  └──────────┘              └──────────────────┼─────────┬─────────┘
//!                                               │         │ 20 ms ticks
//!  ┌──────────┐  /ws (control: state, routes)   │   ┌─────┴───────┐
//!  │ Operator │◀───────────────────────────────▶│   │ PacedSender │
//!  │ browser  │◀──────────────────────────────▶ │   └─────────────┘
//!  └──────────┘  /audio (bridge: "DSH" frames)
//! ```
//!
//! Audio payloads are opaque bytes; the fabric never decodes them.

pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod registry;
pub mod routing;
pub mod stats;
pub mod ui;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Nominal interval between audio frames (and pacer ticks)
    pub const PACKET_INTERVAL_MS: u64 = 20;

    /// Per-flow pacer queue cap (10 frames ~ 200 ms of audio)
    pub const MAX_BUFFER_SIZE: usize = 10;

    /// A queued frame older than this is flagged as a latency violation
    pub const MAX_LATENCY_MS: u64 = 100;

    /// Inter-arrival deltas kept per endpoint for jitter estimation
    pub const JITTER_WINDOW: usize = 100;

    /// Inter-send intervals and violations kept by the pacer
    pub const TIMING_HISTORY: usize = 100;

    /// Sequence gaps at least this large are treated as a reset, not loss
    pub const SEQUENCE_RESET_THRESHOLD: u16 = 1000;

    /// Accumulated monitor events are flushed to control clients at this rate
    pub const MONITOR_FLUSH_MS: u64 = 100;

    /// Seconds an endpoint may stay silent before it is marked offline
    pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

    /// Seconds an offline endpoint is retained before garbage collection
    pub const CLEANUP_AFTER_SECS: u64 = 3600;

    /// Default UDP port for audio frames
    pub const DEFAULT_UDP_PORT: u16 = 5000;

    /// Default port for the WebSocket control and bridge channels
    pub const DEFAULT_WS_PORT: u16 = 8080;

    /// MTU guard for datagram reads
    pub const MAX_PACKET_SIZE: usize = 1472;

    /// Advertised sample rate (the fabric never decodes audio)
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Advertised channel count
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Advertised Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 32_000;

    /// Registry capacity bound
    pub const MAX_DEVICES: usize = 64;

    /// Conference/group cardinality bound
    pub const MAX_GROUP_SIZE: usize = 16;

    /// Keepalive ping cadence on control connections (seconds)
    pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;

    /// A control client that cannot accept a write within this bound is dropped
    pub const CLIENT_WRITE_TIMEOUT_MS: u64 = 5000;
}
