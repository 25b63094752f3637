//! Control channel
//!
//! One task per client. The client gets an `initial-state` snapshot on
//! connect, then a stream of keepalive pings, batched packet-monitor
//! events and global state-change broadcasts. Commands come back the
//! other way; `get-*` responses go to the requester only, mutations are
//! broadcast to everyone.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::constants::{CLIENT_WRITE_TIMEOUT_MS, MONITOR_FLUSH_MS};
use crate::protocol::{ClientCommand, PacketInfo, ServerEvent};
use crate::ui::AppState;

const WRITE_TIMEOUT: Duration = Duration::from_millis(CLIENT_WRITE_TIMEOUT_MS);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(mut socket: WebSocket, state: Arc<AppState>) {
    let mut events_rx = state.events.subscribe();
    let mut monitor_rx = state.udp.subscribe_monitor();

    if send_event(&mut socket, &initial_state(&state)).await.is_err() {
        return;
    }
    debug!("control client connected");

    let mut ping = tokio::time::interval(state.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ping.tick().await;
    let mut flush = tokio::time::interval(Duration::from_millis(MONITOR_FLUSH_MS));
    flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
    flush.tick().await;
    let mut pending: Vec<PacketInfo> = Vec::new();

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = match serde_json::from_str::<ClientCommand>(&text) {
                        Ok(command) => handle_command(&state, command),
                        Err(e) => Some(ServerEvent::Error {
                            message: format!("malformed message: {}", e),
                        }),
                    };
                    if let Some(reply) = reply {
                        if send_event(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if socket.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
            event = events_rx.recv() => match event {
                Ok(event) => {
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("control client lagged by {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            info = monitor_rx.recv() => match info {
                Ok(info) => pending.push(info),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = flush.tick() => {
                if !pending.is_empty() {
                    let event = ServerEvent::Packets {
                        packets: std::mem::take(&mut pending),
                    };
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
            },
            _ = ping.tick() => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            },
        }
    }
    debug!("control client disconnected");
}

fn initial_state(state: &AppState) -> ServerEvent {
    ServerEvent::InitialState {
        devices: state.registry.snapshot(Instant::now()),
        routing: state.routing.routing_matrix(),
        stats: state.stats.snapshot(),
        audio: state.audio_params.clone(),
    }
}

/// Apply one command. The return value goes to the requester only;
/// global mutations additionally go out on the broadcast channel.
fn handle_command(state: &AppState, command: ClientCommand) -> Option<ServerEvent> {
    match command {
        ClientCommand::GetDevices => Some(ServerEvent::Devices {
            devices: state.registry.snapshot(Instant::now()),
        }),
        ClientCommand::GetRoutes => Some(ServerEvent::Routes {
            routing: state.routing.routing_matrix(),
        }),
        ClientCommand::GetStats => Some(ServerEvent::Stats {
            stats: state.stats.snapshot(),
        }),
        ClientCommand::Ping => Some(ServerEvent::Pong),
        ClientCommand::ExportConfig => Some(ServerEvent::ConfigExport {
            config: state.routing.export_config(),
        }),
        ClientCommand::SetRoute { source, target } => {
            state.routing.set_route(source, target);
            broadcast(state, ServerEvent::RouteCreated { source, target });
            broadcast_routes(state);
            None
        }
        ClientCommand::RemoveRoute { source, target } => {
            state.routing.remove_route(source, target);
            broadcast(state, ServerEvent::RouteRemoved { source, target });
            broadcast_routes(state);
            None
        }
        ClientCommand::CreateBidirectional { device_a, device_b } => {
            state.routing.create_bidirectional(device_a, device_b);
            broadcast(state, ServerEvent::BidirectionalCreated { device_a, device_b });
            broadcast_routes(state);
            None
        }
        ClientCommand::EnableBroadcast { device_id } => {
            state.routing.enable_broadcast(device_id);
            broadcast_routes(state);
            None
        }
        ClientCommand::DisableBroadcast { device_id } => {
            state.routing.disable_broadcast(device_id);
            broadcast_routes(state);
            None
        }
        ClientCommand::MuteDevice { device_id } => {
            state.routing.mute(device_id);
            broadcast_routes(state);
            None
        }
        ClientCommand::UnmuteDevice { device_id } => {
            state.routing.unmute(device_id);
            broadcast_routes(state);
            None
        }
        ClientCommand::ApplyScenario { scenario } => {
            match state.routing.apply_scenario(&scenario) {
                Ok(_) => {
                    broadcast_routes(state);
                    None
                }
                Err(e) => Some(ServerEvent::Error {
                    message: e.to_string(),
                }),
            }
        }
        ClientCommand::ImportConfig { config } => {
            state.routing.import_config(&config);
            broadcast_routes(state);
            None
        }
    }
}

fn broadcast(state: &AppState, event: ServerEvent) {
    let _ = state.events.send(event);
}

fn broadcast_routes(state: &AppState) {
    broadcast(
        state,
        ServerEvent::Routes {
            routing: state.routing.routing_matrix(),
        },
    );
}

/// Serialize and send with a write timeout. A slow or broken client is
/// dropped rather than back-pressuring the broadcast.
async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("event serialization failed: {}", e);
            return Ok(());
        }
    };
    match tokio::time::timeout(WRITE_TIMEOUT, socket.send(Message::Text(text))).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioConfig, DeviceConfig};
    use crate::network::{PacedSender, UdpServer};
    use crate::protocol::{AudioParams, DeviceId, PacketType};
    use crate::registry::DeviceRegistry;
    use crate::routing::RoutingEngine;
    use crate::stats::ServerStats;
    use tokio::net::UdpSocket;

    fn id(label: &str) -> DeviceId {
        DeviceId::new(label)
    }

    async fn state() -> Arc<AppState> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (events, _) = broadcast::channel(64);
        let registry = Arc::new(DeviceRegistry::new(
            &DeviceConfig::default(),
            &AudioConfig::default(),
            events.clone(),
        ));
        let routing = Arc::new(RoutingEngine::new(registry.clone(), 16));
        let stats = Arc::new(ServerStats::new());
        let pacer = Arc::new(PacedSender::new(
            socket.clone(),
            registry.clone(),
            stats.clone(),
        ));
        let udp = Arc::new(UdpServer::new(
            socket,
            registry.clone(),
            routing.clone(),
            pacer.clone(),
            stats.clone(),
            1472,
        ));
        Arc::new(AppState {
            registry,
            routing,
            stats,
            udp,
            pacer,
            events,
            audio_params: AudioParams {
                sample_rate: 48000,
                frame_duration_ms: 20,
                channels: 1,
                opus_bitrate: 32_000,
            },
            ping_interval: Duration::from_secs(30),
        })
    }

    #[tokio::test]
    async fn test_bidirectional_command_broadcasts() {
        let state = state().await;
        let mut rx = state.events.subscribe();

        let command: ClientCommand = serde_json::from_str(
            r#"{"type":"create-bidirectional","deviceA":"001","deviceB":"002"}"#,
        )
        .unwrap();
        let reply = handle_command(&state, command);
        assert!(reply.is_none());

        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerEvent::BidirectionalCreated { device_a, device_b }
                if device_a == id("001") && device_b == id("002")
        ));
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::Routes { .. }));

        assert_eq!(state.routing.routes_for(id("001")), vec![id("002")]);
        assert_eq!(state.routing.routes_for(id("002")), vec![id("001")]);
    }

    #[tokio::test]
    async fn test_get_commands_reply_directly() {
        let state = state().await;
        let mut rx = state.events.subscribe();

        assert!(matches!(
            handle_command(&state, ClientCommand::GetStats),
            Some(ServerEvent::Stats { .. })
        ));
        assert!(matches!(
            handle_command(&state, ClientCommand::Ping),
            Some(ServerEvent::Pong)
        ));
        // Nothing was broadcast
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_scenario_errors_to_requester() {
        let state = state().await;
        let reply = handle_command(
            &state,
            ClientCommand::ApplyScenario {
                scenario: "ring".to_string(),
            },
        );
        assert!(matches!(reply, Some(ServerEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let state = state().await;
        state.routing.set_route(id("001"), id("002"));
        state.routing.mute(id("003"));

        let exported = match handle_command(&state, ClientCommand::ExportConfig) {
            Some(ServerEvent::ConfigExport { config }) => config,
            other => panic!("unexpected reply: {:?}", other),
        };

        state.routing.reset(true);
        handle_command(
            &state,
            ClientCommand::ImportConfig {
                config: exported.clone(),
            },
        );
        assert_eq!(state.routing.export_config(), exported);
    }

    #[tokio::test]
    async fn test_initial_state_contents() {
        let state = state().await;
        state
            .registry
            .update_from_datagram(
                id("001"),
                "10.0.0.1:5005".parse().unwrap(),
                0,
                PacketType::Audio,
                Instant::now(),
            )
            .unwrap();

        match initial_state(&state) {
            ServerEvent::InitialState { devices, routing, audio, .. } => {
                assert_eq!(devices.len(), 1);
                assert!(routing.contains_key(&id("001")));
                assert_eq!(audio.sample_rate, 48000);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
