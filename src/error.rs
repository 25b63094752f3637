//! Error types for the audio fabric

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire format errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("Unknown packet type: 0x{0:04x}")]
    UnknownType(u16),

    #[error("Invalid control payload: {0}")]
    InvalidControl(String),

    #[error("Invalid base64 payload: {0}")]
    InvalidBase64(String),
}

/// Endpoint registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Maximum devices reached: {0}")]
    MaxDevicesReached(usize),
}

/// Routing engine errors
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("Group too large: {size} members (max {max})")]
    GroupTooLarge { size: usize, max: usize },

    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
