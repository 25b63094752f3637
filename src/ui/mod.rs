//! WebSocket surface: control channel and virtual-endpoint bridge

pub mod bridge;
pub mod control;
pub mod server;

pub use server::{AppState, WebServer};
