//! Per-endpoint state
//!
//! An endpoint is anything with a 4-byte id: a physical device reachable
//! over UDP, or the control-plane-backed virtual endpoint. Sequence and
//! jitter accounting applies to audio frames only.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use crate::constants::{JITTER_WINDOW, SEQUENCE_RESET_THRESHOLD};
use crate::protocol::{DeviceId, DeviceStats};

pub struct Endpoint {
    pub id: DeviceId,
    /// Egress address; `None` for virtual endpoints
    pub addr: Option<SocketAddr>,
    pub online: bool,
    pub is_virtual: bool,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub last_heartbeat: Option<Instant>,
    /// Last audio sequence number, `None` until the first frame
    pub last_sequence: Option<u16>,
    pub packets_received: u64,
    pub packets_lost: u64,
    last_packet_at: Option<Instant>,
    /// Last 100 |inter-arrival − frame duration| deltas, in milliseconds
    jitter_window: VecDeque<f64>,
}

impl Endpoint {
    pub fn new(id: DeviceId, addr: SocketAddr, now: Instant) -> Self {
        Self {
            id,
            addr: Some(addr),
            online: true,
            is_virtual: false,
            first_seen: now,
            last_seen: now,
            last_heartbeat: None,
            last_sequence: None,
            packets_received: 0,
            packets_lost: 0,
            last_packet_at: None,
            jitter_window: VecDeque::with_capacity(JITTER_WINDOW),
        }
    }

    pub fn new_virtual(id: DeviceId, now: Instant) -> Self {
        Self {
            id,
            addr: None,
            online: true,
            is_virtual: true,
            first_seen: now,
            last_seen: now,
            last_heartbeat: None,
            last_sequence: None,
            packets_received: 0,
            packets_lost: 0,
            last_packet_at: None,
            jitter_window: VecDeque::new(),
        }
    }

    /// Account one audio frame: sequence gap detection plus jitter.
    ///
    /// A gap of `SEQUENCE_RESET_THRESHOLD` or more is treated as a device
    /// reset or heavy reordering and not counted as loss; sequence
    /// wraparound at 2^16 therefore never shows up as a 65535-packet gap.
    pub fn record_audio(&mut self, seq: u16, now: Instant, frame_duration_ms: f64) {
        if let Some(last) = self.last_sequence {
            let expected = last.wrapping_add(1);
            if seq != expected {
                let lost = seq.wrapping_sub(expected);
                if lost < SEQUENCE_RESET_THRESHOLD {
                    self.packets_lost += lost as u64;
                }
            }
        }
        self.last_sequence = Some(seq);
        self.packets_received += 1;

        if let Some(prev) = self.last_packet_at {
            let delta_ms = now.duration_since(prev).as_secs_f64() * 1000.0;
            self.jitter_window.push_back((delta_ms - frame_duration_ms).abs());
            while self.jitter_window.len() > JITTER_WINDOW {
                self.jitter_window.pop_front();
            }
        }
        self.last_packet_at = Some(now);
    }

    pub fn average_jitter_ms(&self) -> f64 {
        if self.jitter_window.is_empty() {
            return 0.0;
        }
        self.jitter_window.iter().sum::<f64>() / self.jitter_window.len() as f64
    }

    pub fn loss_rate(&self) -> f64 {
        let total = self.packets_received + self.packets_lost;
        if total == 0 {
            0.0
        } else {
            self.packets_lost as f64 / total as f64
        }
    }

    pub fn stats(&self, now: Instant) -> DeviceStats {
        DeviceStats {
            device_id: self.id,
            address: self.addr.map(|a| a.to_string()),
            online: self.online,
            is_virtual: self.is_virtual,
            uptime_seconds: now.duration_since(self.first_seen).as_secs(),
            packets_received: self.packets_received,
            packets_lost: self.packets_lost,
            loss_rate: self.loss_rate(),
            average_jitter_ms: self.average_jitter_ms(),
        }
    }
}
