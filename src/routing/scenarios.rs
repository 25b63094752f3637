//! Scenario presets
//!
//! Named topologies applied over a snapshot of the online set. The
//! snapshot is sorted by id, so `pairs`, `chain` and `hub` are
//! deterministic for a given fleet.

use std::fmt;
use std::str::FromStr;

use crate::error::RoutingError;
use crate::protocol::DeviceId;
use crate::routing::RoutingEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Full mesh over the online set
    AllToAll,
    /// Consecutive bidirectional pairings; an odd endpoint stays unrouted
    Pairs,
    /// n−1 directed edges following id order
    Chain,
    /// First endpoint exchanges audio with every other
    Hub,
    /// Wipe all routing state
    Clear,
}

impl FromStr for Scenario {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all-to-all" => Ok(Scenario::AllToAll),
            "pairs" => Ok(Scenario::Pairs),
            "chain" => Ok(Scenario::Chain),
            "hub" => Ok(Scenario::Hub),
            "clear" => Ok(Scenario::Clear),
            other => Err(RoutingError::UnknownScenario(other.to_string())),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scenario::AllToAll => "all-to-all",
            Scenario::Pairs => "pairs",
            Scenario::Chain => "chain",
            Scenario::Hub => "hub",
            Scenario::Clear => "clear",
        };
        f.write_str(name)
    }
}

impl Scenario {
    /// Rebuild routes for this preset. Presets replace routes and
    /// broadcast flags; only `clear` also wipes mutes and groups.
    pub(crate) fn apply(self, engine: &RoutingEngine, online: &[DeviceId]) {
        match self {
            Scenario::Clear => engine.reset(true),
            Scenario::AllToAll => {
                engine.reset(false);
                for &source in online {
                    engine.set_routes(
                        source,
                        online.iter().copied().filter(|&t| t != source),
                    );
                }
            }
            Scenario::Pairs => {
                engine.reset(false);
                for pair in online.chunks(2) {
                    if let [a, b] = *pair {
                        engine.create_bidirectional(a, b);
                    }
                }
            }
            Scenario::Chain => {
                engine.reset(false);
                for link in online.windows(2) {
                    engine.set_route(link[0], link[1]);
                }
            }
            Scenario::Hub => {
                engine.reset(false);
                if let Some((&hub, spokes)) = online.split_first() {
                    for &spoke in spokes {
                        engine.create_bidirectional(hub, spoke);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioConfig, DeviceConfig};
    use crate::protocol::PacketType;
    use crate::registry::DeviceRegistry;
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::sync::broadcast;

    fn id(label: &str) -> DeviceId {
        DeviceId::new(label)
    }

    fn engine(labels: &[&str]) -> RoutingEngine {
        let (events, _) = broadcast::channel(64);
        let registry = Arc::new(DeviceRegistry::new(
            &DeviceConfig::default(),
            &AudioConfig::default(),
            events,
        ));
        let now = Instant::now();
        for (i, label) in labels.iter().enumerate() {
            let addr = format!("10.0.0.{}:5005", i + 1).parse().unwrap();
            registry
                .update_from_datagram(id(label), addr, 0, PacketType::Audio, now)
                .unwrap();
        }
        RoutingEngine::new(registry, 16)
    }

    #[test]
    fn test_unknown_scenario() {
        let engine = engine(&["001"]);
        let err = engine.apply_scenario("ring").unwrap_err();
        assert!(matches!(err, RoutingError::UnknownScenario(_)));
    }

    #[test]
    fn test_all_to_all() {
        let engine = engine(&["001", "002", "003"]);
        engine.apply_scenario("all-to-all").unwrap();
        assert_eq!(engine.routes_for(id("001")), vec![id("002"), id("003")]);
        assert_eq!(engine.routes_for(id("002")), vec![id("001"), id("003")]);
        assert_eq!(engine.routes_for(id("003")), vec![id("001"), id("002")]);
    }

    #[test]
    fn test_pairs() {
        let engine = engine(&["001", "002", "003", "004", "005"]);
        engine.apply_scenario("pairs").unwrap();
        assert_eq!(engine.routes_for(id("001")), vec![id("002")]);
        assert_eq!(engine.routes_for(id("002")), vec![id("001")]);
        assert_eq!(engine.routes_for(id("003")), vec![id("004")]);
        assert_eq!(engine.routes_for(id("004")), vec![id("003")]);
        // Odd endpoint out
        assert!(engine.routes_for(id("005")).is_empty());
    }

    #[test]
    fn test_chain() {
        let engine = engine(&["001", "002", "003"]);
        engine.apply_scenario("chain").unwrap();
        assert_eq!(engine.routes_for(id("001")), vec![id("002")]);
        assert_eq!(engine.routes_for(id("002")), vec![id("003")]);
        assert!(engine.routes_for(id("003")).is_empty());
    }

    #[test]
    fn test_hub() {
        let engine = engine(&["001", "002", "003"]);
        engine.apply_scenario("hub").unwrap();
        assert_eq!(engine.routes_for(id("001")), vec![id("002"), id("003")]);
        assert_eq!(engine.routes_for(id("002")), vec![id("001")]);
        assert_eq!(engine.routes_for(id("003")), vec![id("001")]);
    }

    #[test]
    fn test_clear_wipes_everything() {
        let engine = engine(&["001", "002"]);
        engine.apply_scenario("all-to-all").unwrap();
        engine.mute(id("002"));
        engine.apply_scenario("clear").unwrap();
        assert!(engine.routes_for(id("001")).is_empty());
        assert!(!engine.is_muted(id("002")));
    }

    #[test]
    fn test_presets_skip_offline() {
        use std::time::Duration;

        let (events, _) = broadcast::channel(64);
        let registry = Arc::new(DeviceRegistry::new(
            &DeviceConfig::default(),
            &AudioConfig::default(),
            events,
        ));
        let start = Instant::now();
        for (i, label) in ["001", "002", "003"].iter().enumerate() {
            let addr = format!("10.0.0.{}:5005", i + 1).parse().unwrap();
            registry
                .update_from_datagram(id(label), addr, 0, PacketType::Audio, start)
                .unwrap();
        }
        // 001 and 003 stay fresh; 002 goes silent past the timeout
        for label in ["001", "003"] {
            registry
                .update_from_datagram(
                    id(label),
                    "10.0.0.9:5005".parse().unwrap(),
                    1,
                    PacketType::Audio,
                    start + Duration::from_secs(8),
                )
                .unwrap();
        }
        registry.check_timeouts(start + Duration::from_secs(11));

        let engine = RoutingEngine::new(registry, 16);
        engine.apply_scenario("all-to-all").unwrap();
        assert_eq!(engine.routes_for(id("001")), vec![id("003")]);
    }
}
