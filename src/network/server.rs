//! Datagram server
//!
//! Owns the UDP socket: parses arriving datagrams, feeds the registry,
//! asks the routing engine for targets and performs egress. Frames from
//! the virtual endpoint toward physical endpoints go through the pacer;
//! every other pair sends directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{NetworkError, Result};
use crate::network::PacedSender;
use crate::protocol::{
    DatagramCommand, DeviceId, Packet, PacketInfo, PacketType, HEADER_LEN, VIRTUAL_DEVICE,
};
use crate::registry::DeviceRegistry;
use crate::routing::RoutingEngine;
use crate::stats::ServerStats;

/// An audio frame whose routing targets include the virtual endpoint,
/// fanned out to every bridge client
#[derive(Debug, Clone)]
pub struct BridgeAudioFrame {
    pub from: DeviceId,
    pub sequence: u16,
    pub payload: Bytes,
    pub timestamp_ms: u64,
}

pub struct UdpServer {
    socket: Arc<UdpSocket>,
    registry: Arc<DeviceRegistry>,
    routing: Arc<RoutingEngine>,
    pacer: Arc<PacedSender>,
    stats: Arc<ServerStats>,
    monitor: broadcast::Sender<PacketInfo>,
    bridge_audio: broadcast::Sender<BridgeAudioFrame>,
    max_packet_size: usize,
}

impl UdpServer {
    pub fn new(
        socket: Arc<UdpSocket>,
        registry: Arc<DeviceRegistry>,
        routing: Arc<RoutingEngine>,
        pacer: Arc<PacedSender>,
        stats: Arc<ServerStats>,
        max_packet_size: usize,
    ) -> Self {
        let (monitor, _) = broadcast::channel(1024);
        let (bridge_audio, _) = broadcast::channel(256);
        Self {
            socket,
            registry,
            routing,
            pacer,
            stats,
            monitor,
            bridge_audio,
            max_packet_size,
        }
    }

    /// Bind the datagram socket
    pub async fn bind(port: u16) -> Result<Arc<UdpSocket>> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|e| NetworkError::BindFailed(format!("port {}: {}", port, e)))?;
        info!("datagram socket bound on 0.0.0.0:{}", port);
        Ok(Arc::new(socket))
    }

    /// Per-datagram monitor feed; the control plane batches and flushes it
    pub fn subscribe_monitor(&self) -> broadcast::Receiver<PacketInfo> {
        self.monitor.subscribe()
    }

    /// Frames routed to the virtual endpoint
    pub fn subscribe_bridge_audio(&self) -> broadcast::Receiver<BridgeAudioFrame> {
        self.bridge_audio.subscribe()
    }

    /// Receive loop; exits on cancellation
    pub async fn run(&self, cancel: CancellationToken) {
        let mut buf = vec![0u8; self.max_packet_size];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, addr)) => self.handle_datagram(&buf[..len], addr).await,
                    Err(e) => warn!("datagram receive error: {}", e),
                }
            }
        }
        info!("datagram server stopped");
    }

    async fn handle_datagram(&self, buf: &[u8], addr: SocketAddr) {
        self.stats.record_received(buf.len());

        if buf.len() < HEADER_LEN {
            debug!("runt datagram ({} bytes) from {}", buf.len(), addr);
            self.stats.record_dropped();
            return;
        }

        let packet = match Packet::parse(buf) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping datagram from {}: {}", addr, e);
                self.stats.record_dropped();
                return;
            }
        };

        let now = Instant::now();
        if let Err(e) = self.registry.update_from_datagram(
            packet.device_id,
            addr,
            packet.sequence,
            packet.packet_type,
            now,
        ) {
            warn!("rejecting datagram from {}: {}", addr, e);
            self.stats.record_dropped();
            return;
        }

        let _ = self.monitor.send(PacketInfo {
            device_id: packet.device_id,
            sequence: packet.sequence,
            packet_type: packet.packet_type.name(),
            size: buf.len(),
        });

        match packet.packet_type {
            PacketType::Audio => self.route_audio(&packet).await,
            PacketType::Control => self.apply_control(&packet),
            PacketType::Heartbeat => {
                self.registry.record_heartbeat(packet.device_id, now);
                let reply = Packet::heartbeat_reply().encode();
                if let Err(e) = self.socket.send_to(&reply, addr).await {
                    debug!("heartbeat reply to {} failed: {}", addr, e);
                }
            }
        }
    }

    async fn route_audio(&self, packet: &Packet) {
        for target in self.routing.routes_for(packet.device_id) {
            self.dispatch(packet, target).await;
        }
    }

    /// Egress one frame to one target. Offline targets are skipped
    /// silently; send failures count as drops and are not retried.
    async fn dispatch(&self, packet: &Packet, target: DeviceId) {
        if target == VIRTUAL_DEVICE {
            let _ = self.bridge_audio.send(BridgeAudioFrame {
                from: packet.device_id,
                sequence: packet.sequence,
                payload: packet.payload.clone(),
                timestamp_ms: epoch_ms(),
            });
            self.stats.record_routed();
            return;
        }

        if !self.registry.is_online(target) {
            return;
        }

        if PacedSender::should_pace(packet.device_id, target) {
            self.pacer.enqueue(packet, target);
            return;
        }

        match self.registry.address_of(target) {
            Some(addr) => {
                let wire = packet.encode();
                match self.socket.send_to(&wire, addr).await {
                    Ok(sent) => {
                        self.stats.record_routed();
                        self.stats.record_transmitted(sent);
                    }
                    Err(e) => {
                        warn!("send to {} ({}) failed: {}", target, addr, e);
                        self.stats.record_dropped();
                    }
                }
            }
            None => self.stats.record_dropped(),
        }
    }

    /// Limited in-band command set carried by 0x0002 datagrams
    fn apply_control(&self, packet: &Packet) {
        let command: DatagramCommand = match serde_json::from_slice(&packet.payload) {
            Ok(command) => command,
            Err(e) => {
                warn!("malformed control payload from {}: {}", packet.device_id, e);
                return;
            }
        };
        match command.command.as_str() {
            "route" => match command.target {
                Some(target) => self.routing.set_route(packet.device_id, target),
                None => warn!("route command from {} missing target", packet.device_id),
            },
            "broadcast" => {
                if command.enabled.unwrap_or(true) {
                    self.routing.enable_broadcast(packet.device_id);
                } else {
                    self.routing.disable_broadcast(packet.device_id);
                }
            }
            "mute" => {
                if command.enabled.unwrap_or(true) {
                    self.routing.mute(packet.device_id);
                } else {
                    self.routing.unmute(packet.device_id);
                }
            }
            other => warn!(
                "unknown control command {:?} from {}",
                other, packet.device_id
            ),
        }
    }

    /// Bridge entry point: a frame produced by the virtual endpoint enters
    /// the egress pipeline as if it had arrived on the socket, except the
    /// target list comes from the caller instead of the routing matrix.
    pub async fn inject_from_virtual(&self, packet: Packet, targets: &[DeviceId]) {
        for &target in targets {
            self.dispatch(&packet, target).await;
        }
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioConfig, DeviceConfig};
    use std::time::Duration;

    fn id(label: &str) -> DeviceId {
        DeviceId::new(label)
    }

    async fn server() -> (UdpServer, Arc<ServerStats>) {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (events, _) = broadcast::channel(64);
        let registry = Arc::new(DeviceRegistry::new(
            &DeviceConfig::default(),
            &AudioConfig::default(),
            events,
        ));
        let routing = Arc::new(RoutingEngine::new(registry.clone(), 16));
        let stats = Arc::new(ServerStats::new());
        let pacer = Arc::new(PacedSender::new(
            socket.clone(),
            registry.clone(),
            stats.clone(),
        ));
        let server = UdpServer::new(socket, registry, routing, pacer, stats.clone(), 1472);
        (server, stats)
    }

    #[tokio::test]
    async fn test_echo_resends_exact_bytes() {
        let (server, stats) = server().await;
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device.local_addr().unwrap();

        let wire = [0x30, 0x30, 0x31, 0x00, 0x00, 0x2A, 0x00, 0x01, 0xAA, 0xBB];

        // First frame registers the endpoint; no routes yet
        server.handle_datagram(&wire, device_addr).await;
        assert_eq!(stats.packets_routed(), 0);

        server.routing.set_route(id("001"), id("001"));
        server.handle_datagram(&wire, device_addr).await;

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), device.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &wire);
        assert_eq!(stats.packets_routed(), 1);
    }

    #[tokio::test]
    async fn test_runt_datagram_dropped() {
        let (server, stats) = server().await;
        server
            .handle_datagram(&[0x30, 0x30, 0x31], "127.0.0.1:9999".parse().unwrap())
            .await;
        assert_eq!(stats.packets_dropped(), 1);
        assert!(server.registry.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type_dropped() {
        let (server, stats) = server().await;
        let wire = [0x30, 0x30, 0x31, 0x00, 0x00, 0x00, 0x00, 0x99];
        server
            .handle_datagram(&wire, "127.0.0.1:9999".parse().unwrap())
            .await;
        assert_eq!(stats.packets_dropped(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_reply() {
        let (server, _) = server().await;
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device.local_addr().unwrap();

        let heartbeat = [0x30, 0x30, 0x31, 0x00, 0x00, 0x00, 0x00, 0x03];
        server.handle_datagram(&heartbeat, device_addr).await;

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), device.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &[b'S', b'R', b'V', b'R', 0x00, 0x00, 0x00, 0x03]);
    }

    #[tokio::test]
    async fn test_control_datagram_sets_route() {
        let (server, _) = server().await;
        let payload = br#"{"command":"route","target":"002"}"#;
        let packet = Packet {
            device_id: id("001"),
            sequence: 0,
            packet_type: PacketType::Control,
            payload: Bytes::from_static(payload),
        };
        server
            .handle_datagram(&packet.encode(), "127.0.0.1:9999".parse().unwrap())
            .await;
        assert_eq!(server.routing.routes_for(id("001")), vec![id("002")]);
    }

    #[tokio::test]
    async fn test_malformed_control_ignored() {
        let (server, _) = server().await;
        let packet = Packet {
            device_id: id("001"),
            sequence: 0,
            packet_type: PacketType::Control,
            payload: Bytes::from_static(b"not json"),
        };
        server
            .handle_datagram(&packet.encode(), "127.0.0.1:9999".parse().unwrap())
            .await;
        assert!(server.routing.routes_for(id("001")).is_empty());
    }

    #[tokio::test]
    async fn test_offline_target_suppressed() {
        let (server, stats) = server().await;
        let device_addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let wire = Packet::audio(id("001"), 0, Bytes::from_static(b"x")).encode();
        server.handle_datagram(&wire, device_addr).await;
        server.routing.set_route(id("001"), id("002"));

        // 002 has never been seen: nothing egresses, nothing routed
        let wire = Packet::audio(id("001"), 1, Bytes::from_static(b"x")).encode();
        server.handle_datagram(&wire, device_addr).await;
        assert_eq!(stats.packets_routed(), 0);
    }

    #[tokio::test]
    async fn test_virtual_source_goes_through_pacer() {
        let (server, _) = server().await;
        let device_addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let wire = Packet::audio(id("001"), 0, Bytes::from_static(b"x")).encode();
        server.handle_datagram(&wire, device_addr).await;

        let packet = Packet::audio(VIRTUAL_DEVICE, 7, Bytes::from_static(b"frame"));
        server.inject_from_virtual(packet, &[id("001")]).await;

        let pacer_stats = server.pacer.stats_snapshot();
        assert_eq!(pacer_stats.flows.len(), 1);
        assert_eq!(pacer_stats.flows[0].depth, 1);
        assert_eq!(pacer_stats.flows[0].target, id("001"));
    }

    #[tokio::test]
    async fn test_frames_to_virtual_reach_bridge() {
        let (server, stats) = server().await;
        let mut bridge_rx = server.subscribe_bridge_audio();
        let device_addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let wire = Packet::audio(id("001"), 0, Bytes::from_static(b"P")).encode();
        server.handle_datagram(&wire, device_addr).await;
        server.routing.set_route(id("001"), VIRTUAL_DEVICE);

        let wire = Packet::audio(id("001"), 1, Bytes::from_static(b"P")).encode();
        server.handle_datagram(&wire, device_addr).await;

        let frame = bridge_rx.try_recv().unwrap();
        assert_eq!(frame.from, id("001"));
        assert_eq!(frame.sequence, 1);
        assert_eq!(&frame.payload[..], b"P");
        assert_eq!(stats.packets_routed(), 1);
    }

    #[tokio::test]
    async fn test_monitor_events() {
        let (server, _) = server().await;
        let mut monitor_rx = server.subscribe_monitor();
        let wire = Packet::audio(id("001"), 3, Bytes::from_static(b"xyz")).encode();
        server
            .handle_datagram(&wire, "127.0.0.1:9999".parse().unwrap())
            .await;

        let info = monitor_rx.try_recv().unwrap();
        assert_eq!(info.device_id, id("001"));
        assert_eq!(info.sequence, 3);
        assert_eq!(info.packet_type, "audio");
        assert_eq!(info.size, 11);
    }
}
