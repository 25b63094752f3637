//! Virtual-endpoint bridge
//!
//! The audio-only WebSocket channel. Browser clients act as the "DSH"
//! endpoint: frames they send are injected into the egress pipeline
//! (and paced toward physical endpoints); frames routed to "DSH" come
//! back as `audio_received`. Opus payloads travel base64-encoded to
//! stay inside the JSON framing.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::constants::CLIENT_WRITE_TIMEOUT_MS;
use crate::network::pacer::TimingEvent;
use crate::protocol::{BridgeCommand, BridgeEvent, Packet, ServerEvent, VIRTUAL_DEVICE};
use crate::ui::AppState;

const WRITE_TIMEOUT: Duration = Duration::from_millis(CLIENT_WRITE_TIMEOUT_MS);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(mut socket: WebSocket, state: Arc<AppState>) {
    let mut audio_rx = state.udp.subscribe_bridge_audio();
    let mut timing_rx = state.pacer.subscribe_timing();

    let hello = BridgeEvent::Connected {
        device_id: VIRTUAL_DEVICE,
    };
    if send_event(&mut socket, &hello).await.is_err() {
        return;
    }
    debug!("bridge client connected");

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = match serde_json::from_str::<BridgeCommand>(&text) {
                        Ok(command) => handle_command(&state, command).await,
                        Err(e) => Some(BridgeEvent::Error {
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
            frame = audio_rx.recv() => match frame {
                Ok(frame) => {
                    let event = BridgeEvent::AudioReceived {
                        from: frame.from,
                        sequence: frame.sequence,
                        opus: BASE64.encode(&frame.payload),
                        timestamp: frame.timestamp_ms,
                    };
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("bridge client lagged by {} frames", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            timing = timing_rx.recv() => match timing {
                Ok(TimingEvent::Update(stats)) => {
                    let event = BridgeEvent::TimingUpdate { stats };
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                Ok(TimingEvent::Violation(violation)) => {
                    let event = BridgeEvent::TimingViolation { violation };
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("bridge client disconnected");
}

async fn handle_command(state: &AppState, command: BridgeCommand) -> Option<BridgeEvent> {
    match command {
        BridgeCommand::AudioPacket { to, sequence, opus, .. } => {
            let payload = match BASE64.decode(opus.as_bytes()) {
                Ok(payload) => Bytes::from(payload),
                Err(e) => {
                    return Some(BridgeEvent::Error {
                        message: format!("invalid base64 payload: {}", e),
                    })
                }
            };
            // Header id is always the virtual endpoint; the message
            // carries the destination, so routing is not consulted.
            let packet = Packet::audio(VIRTUAL_DEVICE, sequence, payload);
            state.udp.inject_from_virtual(packet, &[to]).await;
            None
        }
        BridgeCommand::StartListening { device_id } => {
            state.routing.set_route(device_id, VIRTUAL_DEVICE);
            let _ = state.events.send(ServerEvent::RouteCreated {
                source: device_id,
                target: VIRTUAL_DEVICE,
            });
            Some(BridgeEvent::ListeningStarted { device_id })
        }
        BridgeCommand::StopListening { device_id } => {
            state.routing.remove_route(device_id, VIRTUAL_DEVICE);
            let _ = state.events.send(ServerEvent::RouteRemoved {
                source: device_id,
                target: VIRTUAL_DEVICE,
            });
            Some(BridgeEvent::ListeningStopped { device_id })
        }
        BridgeCommand::RequestStats => Some(BridgeEvent::AudioStats {
            stats: state.pacer.stats_snapshot(),
        }),
        BridgeCommand::SetRoute { source, target } => {
            state.routing.set_route(source, target);
            let _ = state.events.send(ServerEvent::RouteCreated { source, target });
            None
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &BridgeEvent) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("bridge event serialization failed: {}", e);
            return Ok(());
        }
    };
    match tokio::time::timeout(WRITE_TIMEOUT, socket.send(Message::Text(text))).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}
