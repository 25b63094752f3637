//! WebSocket server
//!
//! One listener, two endpoints: `/ws` carries routing and state
//! (control channel), `/audio` carries virtual-endpoint audio frames
//! (bridge channel).

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::WebSocketConfig;
use crate::error::Result;
use crate::network::{PacedSender, UdpServer};
use crate::protocol::{AudioParams, ServerEvent};
use crate::registry::DeviceRegistry;
use crate::routing::RoutingEngine;
use crate::stats::ServerStats;

/// Shared state handed to every connection handler
pub struct AppState {
    pub registry: Arc<DeviceRegistry>,
    pub routing: Arc<RoutingEngine>,
    pub stats: Arc<ServerStats>,
    pub udp: Arc<UdpServer>,
    pub pacer: Arc<PacedSender>,
    pub events: broadcast::Sender<ServerEvent>,
    pub audio_params: AudioParams,
    pub ping_interval: Duration,
}

pub struct WebServer {
    state: Arc<AppState>,
    bind_address: String,
    port: u16,
}

impl WebServer {
    pub fn new(config: &WebSocketConfig, state: Arc<AppState>) -> Self {
        Self {
            state,
            bind_address: config.bind_address.clone(),
            port: config.port,
        }
    }

    pub fn router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/ws", get(crate::ui::control::ws_handler))
            .route("/audio", get(crate::ui::bridge::ws_handler))
            .route("/health", get(|| async { "ok" }))
            .with_state(state)
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind((self.bind_address.as_str(), self.port)).await?;
        info!(
            "control channel on ws://{}:{}/ws, bridge on /audio",
            self.bind_address, self.port
        );
        axum::serve(listener, Self::router(self.state.clone()))
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }
}
