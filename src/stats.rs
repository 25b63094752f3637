//! Global server counters
//!
//! An explicit service handle passed to whoever needs it; counters are
//! atomics and reads are loose (no cross-counter consistency).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::protocol::ServerStatsSnapshot;

pub struct ServerStats {
    packets_received: AtomicU64,
    packets_routed: AtomicU64,
    packets_dropped: AtomicU64,
    bytes_received: AtomicU64,
    bytes_transmitted: AtomicU64,
    started: Instant,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            packets_received: AtomicU64::new(0),
            packets_routed: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_transmitted: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_routed(&self) {
        self.packets_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transmitted(&self, bytes: usize) {
        self.bytes_transmitted.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn packets_routed(&self) -> u64 {
        self.packets_routed.load(Ordering::Relaxed)
    }

    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_routed: self.packets_routed.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_transmitted: self.bytes_transmitted.load(Ordering::Relaxed),
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ServerStats::new();
        stats.record_received(100);
        stats.record_received(50);
        stats.record_routed();
        stats.record_dropped();
        stats.record_transmitted(100);

        let snap = stats.snapshot();
        assert_eq!(snap.packets_received, 2);
        assert_eq!(snap.bytes_received, 150);
        assert_eq!(snap.packets_routed, 1);
        assert_eq!(snap.packets_dropped, 1);
        assert_eq!(snap.bytes_transmitted, 100);
    }
}
