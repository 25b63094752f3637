//! Audio Fabric Server
//!
//! Binds the datagram socket, registers the virtual endpoint, starts the
//! pacer and the WebSocket control surface, and runs until ctrl-c.

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_audio_fabric::{
    config::AppConfig,
    network::{PacedSender, UdpServer},
    protocol::{AudioParams, VIRTUAL_DEVICE},
    registry::DeviceRegistry,
    routing::RoutingEngine,
    stats::ServerStats,
    ui::{AppState, WebServer},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LAN Audio Fabric");

    // Config file path as optional first argument
    let config = match std::env::args().nth(1) {
        Some(path) => {
            tracing::info!("loading configuration from {}", path);
            AppConfig::load(&path)?
        }
        None => AppConfig::default(),
    };

    let socket = UdpServer::bind(config.udp.server_port).await?;
    let stats = Arc::new(ServerStats::new());
    let (events, _) = broadcast::channel(256);
    let registry = Arc::new(DeviceRegistry::new(
        &config.device,
        &config.audio,
        events.clone(),
    ));
    let routing = Arc::new(RoutingEngine::new(
        registry.clone(),
        config.routing.max_group_size,
    ));
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
        config.udp.max_packet_size,
    ));

    registry.register_virtual(VIRTUAL_DEVICE);
    tracing::info!("routing mode: {}", config.routing.default_mode);

    let state = Arc::new(AppState {
        registry: registry.clone(),
        routing,
        stats: stats.clone(),
        udp: udp.clone(),
        pacer: pacer.clone(),
        events,
        audio_params: AudioParams {
            sample_rate: config.audio.sample_rate,
            frame_duration_ms: config.audio.frame_duration,
            channels: config.audio.channels,
            opus_bitrate: config.audio.opus_bitrate,
        },
        ping_interval: Duration::from_secs(config.websocket.ping_interval),
    });

    let cancel = CancellationToken::new();

    let udp_task = {
        let udp = udp.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { udp.run(cancel).await })
    };

    let pacer_task = {
        let pacer = pacer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pacer.run(cancel).await })
    };

    // Endpoint liveness: timeout sweep every second, GC every minute
    let liveness_task = {
        let registry = registry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(Duration::from_secs(1));
            let mut gc = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sweep.tick() => {
                        registry.check_timeouts(Instant::now());
                    }
                    _ = gc.tick() => {
                        registry.cleanup(Instant::now());
                    }
                }
            }
        })
    };

    // Periodic stats logging
    let stats_task = {
        let stats = stats.clone();
        let pacer = pacer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let snap = stats.snapshot();
                        let paced = pacer.stats_snapshot();
                        tracing::info!(
                            "stats: {} received, {} routed, {} dropped, {} paced sends",
                            snap.packets_received,
                            snap.packets_routed,
                            snap.packets_dropped,
                            paced.packets_sent,
                        );
                    }
                }
            }
        })
    };

    let web = WebServer::new(&config.websocket, state);
    let web_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = web.run(cancel).await {
                tracing::error!("web server failed: {}", e);
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    cancel.cancel();

    let _ = tokio::join!(udp_task, pacer_task, liveness_task, stats_task, web_task);
    Ok(())
}
