//! Device registry
//!
//! Single writer per endpoint id (serialized by the write lock); list
//! reads return copied snapshots so the control plane never holds the
//! lock across an await point.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::{AudioConfig, DeviceConfig};
use crate::error::RegistryError;
use crate::protocol::{DeviceId, DeviceStats, PacketType, ServerEvent};
use crate::registry::Endpoint;

pub struct DeviceRegistry {
    inner: RwLock<HashMap<DeviceId, Endpoint>>,
    events: broadcast::Sender<ServerEvent>,
    frame_duration_ms: f64,
    timeout: Duration,
    cleanup_after: Duration,
    max_devices: usize,
}

impl DeviceRegistry {
    pub fn new(
        device: &DeviceConfig,
        audio: &AudioConfig,
        events: broadcast::Sender<ServerEvent>,
    ) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            events,
            frame_duration_ms: audio.frame_duration as f64,
            timeout: Duration::from_secs(device.timeout_seconds),
            cleanup_after: Duration::from_secs(crate::constants::CLEANUP_AFTER_SECS),
            max_devices: device.max_devices,
        }
    }

    /// Account an arriving datagram against its source endpoint.
    ///
    /// Creates the endpoint on first use. Liveness and address update for
    /// every packet type; sequence and jitter accounting only for audio.
    /// The virtual endpoint only gets its liveness refreshed — it never
    /// enters loss accounting from datagrams.
    pub fn update_from_datagram(
        &self,
        id: DeviceId,
        addr: SocketAddr,
        seq: u16,
        packet_type: PacketType,
        now: Instant,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().unwrap();

        if let Some(ep) = inner.get_mut(&id) {
            if ep.is_virtual {
                ep.last_seen = now;
                return Ok(());
            }
            ep.addr = Some(addr);
            ep.last_seen = now;
            if packet_type == PacketType::Audio {
                ep.record_audio(seq, now, self.frame_duration_ms);
            }
            if !ep.online {
                ep.online = true;
                info!("device {} reconnected from {}", id, addr);
                let stats = ep.stats(now);
                let _ = self.events.send(ServerEvent::DeviceReconnected { device: stats });
            }
            return Ok(());
        }

        if inner.len() >= self.max_devices {
            return Err(RegistryError::MaxDevicesReached(self.max_devices));
        }

        let mut ep = Endpoint::new(id, addr, now);
        if packet_type == PacketType::Audio {
            ep.record_audio(seq, now, self.frame_duration_ms);
        }
        info!("device {} connected from {}", id, addr);
        let stats = ep.stats(now);
        inner.insert(id, ep);
        let _ = self.events.send(ServerEvent::DeviceConnected { device: stats });
        Ok(())
    }

    /// Register a control-plane-backed endpoint; always online, no address
    pub fn register_virtual(&self, id: DeviceId) {
        let mut inner = self.inner.write().unwrap();
        let now = Instant::now();
        let ep = inner.entry(id).or_insert_with(|| Endpoint::new_virtual(id, now));
        ep.online = true;
        info!("virtual endpoint {} registered", id);
        let stats = ep.stats(now);
        let _ = self.events.send(ServerEvent::DeviceConnected { device: stats });
    }

    pub fn record_heartbeat(&self, id: DeviceId, now: Instant) {
        let mut inner = self.inner.write().unwrap();
        if let Some(ep) = inner.get_mut(&id) {
            ep.last_heartbeat = Some(now);
            ep.last_seen = now;
        }
    }

    /// Mark endpoints offline once they exceed the silence timeout.
    /// Returns the ids that transitioned.
    pub fn check_timeouts(&self, now: Instant) -> Vec<DeviceId> {
        let mut inner = self.inner.write().unwrap();
        let mut expired = Vec::new();
        for ep in inner.values_mut() {
            if ep.online
                && !ep.is_virtual
                && now.duration_since(ep.last_seen) > self.timeout
            {
                ep.online = false;
                expired.push(ep.id);
                info!("device {} timed out", ep.id);
                let _ = self
                    .events
                    .send(ServerEvent::DeviceDisconnected { device_id: ep.id });
            }
        }
        expired
    }

    /// Drop endpoints that have been offline for longer than the GC window
    pub fn cleanup(&self, now: Instant) {
        let mut inner = self.inner.write().unwrap();
        let before = inner.len();
        let cleanup_after = self.cleanup_after;
        inner.retain(|_, ep| {
            ep.is_virtual || ep.online || now.duration_since(ep.last_seen) <= cleanup_after
        });
        let removed = before - inner.len();
        if removed > 0 {
            debug!("garbage collected {} stale endpoints", removed);
        }
    }

    pub fn stats(&self, id: DeviceId, now: Instant) -> Option<DeviceStats> {
        let inner = self.inner.read().unwrap();
        inner.get(&id).map(|ep| ep.stats(now))
    }

    /// Copy-on-read snapshot of every endpoint, sorted by id
    pub fn snapshot(&self, now: Instant) -> Vec<DeviceStats> {
        let inner = self.inner.read().unwrap();
        let mut all: Vec<DeviceStats> = inner.values().map(|ep| ep.stats(now)).collect();
        all.sort_by_key(|s| s.device_id);
        all
    }

    /// Online endpoint ids, sorted for deterministic iteration
    pub fn online_ids(&self) -> Vec<DeviceId> {
        let inner = self.inner.read().unwrap();
        let mut ids: Vec<DeviceId> = inner
            .values()
            .filter(|ep| ep.online)
            .map(|ep| ep.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn registered_ids(&self) -> Vec<DeviceId> {
        let inner = self.inner.read().unwrap();
        let mut ids: Vec<DeviceId> = inner.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_online(&self, id: DeviceId) -> bool {
        let inner = self.inner.read().unwrap();
        inner.get(&id).map(|ep| ep.online).unwrap_or(false)
    }

    /// Egress address for an online physical endpoint
    pub fn address_of(&self, id: DeviceId) -> Option<SocketAddr> {
        let inner = self.inner.read().unwrap();
        inner
            .get(&id)
            .filter(|ep| ep.online && !ep.is_virtual)
            .and_then(|ep| ep.addr)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::VIRTUAL_DEVICE;

    fn registry() -> DeviceRegistry {
        let (events, _) = broadcast::channel(64);
        DeviceRegistry::new(&DeviceConfig::default(), &AudioConfig::default(), events)
    }

    fn addr() -> SocketAddr {
        "10.0.0.1:5005".parse().unwrap()
    }

    #[test]
    fn test_create_on_first_datagram() {
        let reg = registry();
        let now = Instant::now();
        reg.update_from_datagram(DeviceId::new("001"), addr(), 0, PacketType::Audio, now)
            .unwrap();

        let stats = reg.stats(DeviceId::new("001"), now).unwrap();
        assert!(stats.online);
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.address.as_deref(), Some("10.0.0.1:5005"));
    }

    #[test]
    fn test_loss_accounting_through_registry() {
        let reg = registry();
        let now = Instant::now();
        for seq in [0u16, 1, 2, 5] {
            reg.update_from_datagram(DeviceId::new("001"), addr(), seq, PacketType::Audio, now)
                .unwrap();
        }
        let stats = reg.stats(DeviceId::new("001"), now).unwrap();
        assert_eq!(stats.packets_received, 4);
        assert_eq!(stats.packets_lost, 2);
    }

    #[test]
    fn test_heartbeat_does_not_touch_sequence() {
        let reg = registry();
        let now = Instant::now();
        reg.update_from_datagram(DeviceId::new("001"), addr(), 0, PacketType::Audio, now)
            .unwrap();
        reg.update_from_datagram(DeviceId::new("001"), addr(), 0, PacketType::Heartbeat, now)
            .unwrap();
        reg.update_from_datagram(DeviceId::new("001"), addr(), 1, PacketType::Audio, now)
            .unwrap();

        let stats = reg.stats(DeviceId::new("001"), now).unwrap();
        assert_eq!(stats.packets_received, 2);
        assert_eq!(stats.packets_lost, 0);
    }

    #[test]
    fn test_timeout_and_reconnect() {
        let reg = registry();
        let start = Instant::now();
        reg.update_from_datagram(DeviceId::new("001"), addr(), 0, PacketType::Audio, start)
            .unwrap();

        let expired = reg.check_timeouts(start + Duration::from_secs(11));
        assert_eq!(expired, vec![DeviceId::new("001")]);
        assert!(!reg.is_online(DeviceId::new("001")));
        assert!(reg.address_of(DeviceId::new("001")).is_none());

        reg.update_from_datagram(
            DeviceId::new("001"),
            addr(),
            1,
            PacketType::Audio,
            start + Duration::from_secs(12),
        )
        .unwrap();
        assert!(reg.is_online(DeviceId::new("001")));
    }

    #[test]
    fn test_cleanup_removes_stale_offline() {
        let reg = registry();
        let start = Instant::now();
        reg.update_from_datagram(DeviceId::new("001"), addr(), 0, PacketType::Audio, start)
            .unwrap();
        reg.check_timeouts(start + Duration::from_secs(11));

        // Still retained inside the GC window
        reg.cleanup(start + Duration::from_secs(60));
        assert_eq!(reg.len(), 1);

        reg.cleanup(start + Duration::from_secs(3700));
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn test_virtual_endpoint() {
        let reg = registry();
        reg.register_virtual(VIRTUAL_DEVICE);
        assert!(reg.is_online(VIRTUAL_DEVICE));
        assert!(reg.address_of(VIRTUAL_DEVICE).is_none());

        // Never expires and never collects loss
        let later = Instant::now() + Duration::from_secs(3700);
        assert!(reg.check_timeouts(later).is_empty());
        reg.cleanup(later);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_capacity_bound() {
        let (events, _) = broadcast::channel(64);
        let device = DeviceConfig {
            max_devices: 2,
            ..DeviceConfig::default()
        };
        let reg = DeviceRegistry::new(&device, &AudioConfig::default(), events);
        let now = Instant::now();
        reg.update_from_datagram(DeviceId::new("001"), addr(), 0, PacketType::Audio, now)
            .unwrap();
        reg.update_from_datagram(DeviceId::new("002"), addr(), 0, PacketType::Audio, now)
            .unwrap();
        let err = reg
            .update_from_datagram(DeviceId::new("003"), addr(), 0, PacketType::Audio, now)
            .unwrap_err();
        assert!(matches!(err, RegistryError::MaxDevicesReached(2)));
    }

    #[test]
    fn test_connect_events() {
        let (events, mut rx) = broadcast::channel(64);
        let reg = DeviceRegistry::new(&DeviceConfig::default(), &AudioConfig::default(), events);
        let start = Instant::now();
        reg.update_from_datagram(DeviceId::new("001"), addr(), 0, PacketType::Audio, start)
            .unwrap();
        reg.check_timeouts(start + Duration::from_secs(11));
        reg.update_from_datagram(
            DeviceId::new("001"),
            addr(),
            1,
            PacketType::Audio,
            start + Duration::from_secs(12),
        )
        .unwrap();

        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::DeviceConnected { .. }));
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::DeviceDisconnected { .. }));
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::DeviceReconnected { .. }));
    }
}
