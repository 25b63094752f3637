//! Routing policy engine

pub mod engine;
pub mod scenarios;

pub use engine::RoutingEngine;
pub use scenarios::Scenario;
