//! Network subsystem: datagram ingress/egress and paced sending

pub mod pacer;
pub mod server;

pub use pacer::PacedSender;
pub use server::UdpServer;
