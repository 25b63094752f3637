//! Directed routing multigraph
//!
//! All state lives under one mutex. `routes_for` is the per-datagram hot
//! path; its cost is bounded by the online set size. Self-routes are
//! legal and are the only server-side echo mechanism.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::error::RoutingError;
use crate::protocol::{
    DeviceId, RouteEntry, RouteStatus, RoutingMatrix, RoutingSnapshot,
};
use crate::registry::DeviceRegistry;
use crate::routing::Scenario;

#[derive(Default)]
struct RoutingState {
    routes: HashMap<DeviceId, HashSet<DeviceId>>,
    broadcast: HashSet<DeviceId>,
    muted: HashSet<DeviceId>,
    groups: HashMap<String, HashSet<DeviceId>>,
}

pub struct RoutingEngine {
    registry: Arc<DeviceRegistry>,
    inner: Mutex<RoutingState>,
    max_group_size: usize,
}

impl RoutingEngine {
    pub fn new(registry: Arc<DeviceRegistry>, max_group_size: usize) -> Self {
        Self {
            registry,
            inner: Mutex::new(RoutingState::default()),
            max_group_size,
        }
    }

    pub fn set_route(&self, source: DeviceId, target: DeviceId) {
        let mut inner = self.inner.lock().unwrap();
        inner.routes.entry(source).or_default().insert(target);
        debug!("route added: {} -> {}", source, target);
    }

    /// Replace the whole target set for `source`
    pub fn set_routes(&self, source: DeviceId, targets: impl IntoIterator<Item = DeviceId>) {
        let mut inner = self.inner.lock().unwrap();
        let set: HashSet<DeviceId> = targets.into_iter().collect();
        if set.is_empty() {
            inner.routes.remove(&source);
        } else {
            inner.routes.insert(source, set);
        }
    }

    pub fn remove_route(&self, source: DeviceId, target: DeviceId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(targets) = inner.routes.get_mut(&source) {
            targets.remove(&target);
            if targets.is_empty() {
                inner.routes.remove(&source);
            }
            debug!("route removed: {} -> {}", source, target);
        }
    }

    pub fn clear_routes(&self, source: DeviceId) {
        let mut inner = self.inner.lock().unwrap();
        inner.routes.remove(&source);
    }

    pub fn enable_broadcast(&self, id: DeviceId) {
        let mut inner = self.inner.lock().unwrap();
        inner.broadcast.insert(id);
        info!("broadcast enabled for {}", id);
    }

    pub fn disable_broadcast(&self, id: DeviceId) {
        let mut inner = self.inner.lock().unwrap();
        inner.broadcast.remove(&id);
    }

    pub fn mute(&self, id: DeviceId) {
        let mut inner = self.inner.lock().unwrap();
        inner.muted.insert(id);
        info!("{} muted", id);
    }

    pub fn unmute(&self, id: DeviceId) {
        let mut inner = self.inner.lock().unwrap();
        inner.muted.remove(&id);
    }

    pub fn is_muted(&self, id: DeviceId) -> bool {
        self.inner.lock().unwrap().muted.contains(&id)
    }

    pub fn create_bidirectional(&self, a: DeviceId, b: DeviceId) {
        let mut inner = self.inner.lock().unwrap();
        inner.routes.entry(a).or_default().insert(b);
        inner.routes.entry(b).or_default().insert(a);
        info!("bidirectional route: {} <-> {}", a, b);
    }

    /// Full mesh between the given endpoints
    pub fn create_conference(&self, ids: &[DeviceId]) -> Result<(), RoutingError> {
        if ids.len() > self.max_group_size {
            return Err(RoutingError::GroupTooLarge {
                size: ids.len(),
                max: self.max_group_size,
            });
        }
        let mut inner = self.inner.lock().unwrap();
        for &source in ids {
            let targets: HashSet<DeviceId> =
                ids.iter().copied().filter(|&t| t != source).collect();
            if targets.is_empty() {
                inner.routes.remove(&source);
            } else {
                inner.routes.insert(source, targets);
            }
        }
        info!("conference created over {} endpoints", ids.len());
        Ok(())
    }

    pub fn create_group(&self, name: &str, ids: &[DeviceId]) -> Result<(), RoutingError> {
        if ids.len() > self.max_group_size {
            return Err(RoutingError::GroupTooLarge {
                size: ids.len(),
                max: self.max_group_size,
            });
        }
        let mut inner = self.inner.lock().unwrap();
        inner
            .groups
            .insert(name.to_string(), ids.iter().copied().collect());
        info!("group {:?} created with {} members", name, ids.len());
        Ok(())
    }

    /// Remove a member; an emptied group is deleted
    pub fn leave_group(&self, name: &str, id: DeviceId) {
        let mut inner = self.inner.lock().unwrap();
        let emptied = match inner.groups.get_mut(name) {
            Some(members) => {
                members.remove(&id);
                members.is_empty()
            }
            None => false,
        };
        if emptied {
            inner.groups.remove(name);
            debug!("group {:?} deleted (empty)", name);
        }
    }

    pub fn groups_of(&self, id: DeviceId) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut names: Vec<String> = inner
            .groups
            .iter()
            .filter(|(_, members)| members.contains(&id))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Effective targets of `source` — the per-datagram hot path.
    ///
    /// Muted sources route nowhere; broadcast sources reach every online
    /// endpoint except themselves; otherwise explicit routes and group
    /// co-members union. Muted destinations are always subtracted.
    pub fn routes_for(&self, source: DeviceId) -> Vec<DeviceId> {
        let inner = self.inner.lock().unwrap();
        if inner.muted.contains(&source) {
            return Vec::new();
        }

        let mut targets: Vec<DeviceId> = if inner.broadcast.contains(&source) {
            self.registry
                .online_ids()
                .into_iter()
                .filter(|&t| t != source && !inner.muted.contains(&t))
                .collect()
        } else {
            let mut set: HashSet<DeviceId> =
                inner.routes.get(&source).cloned().unwrap_or_default();
            for members in inner.groups.values() {
                if members.contains(&source) {
                    set.extend(members.iter().copied().filter(|&t| t != source));
                }
            }
            set.retain(|t| !inner.muted.contains(t));
            set.into_iter().collect()
        };
        targets.sort();
        targets
    }

    /// Per-endpoint view for the control plane
    pub fn routing_matrix(&self) -> RoutingMatrix {
        let ids = self.registry.registered_ids();
        let mut matrix = RoutingMatrix::new();
        for id in ids {
            let (muted, broadcast) = {
                let inner = self.inner.lock().unwrap();
                (inner.muted.contains(&id), inner.broadcast.contains(&id))
            };
            matrix.insert(
                id,
                RouteStatus {
                    online: self.registry.is_online(id),
                    muted,
                    broadcast,
                    routes: self.routes_for(id),
                    groups: self.groups_of(id),
                },
            );
        }
        matrix
    }

    /// Apply a named preset over the current online set
    pub fn apply_scenario(&self, name: &str) -> Result<Scenario, RoutingError> {
        let scenario: Scenario = name.parse()?;
        let online = self.registry.online_ids();
        scenario.apply(self, &online);
        info!("scenario {} applied over {} endpoints", scenario, online.len());
        Ok(scenario)
    }

    /// Wipe routes and per-source flags; presets call this before applying
    pub fn reset(&self, wipe_groups_and_mutes: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.routes.clear();
        inner.broadcast.clear();
        if wipe_groups_and_mutes {
            inner.muted.clear();
            inner.groups.clear();
        }
    }

    /// Runtime snapshot of routes, broadcast flags and mutes
    pub fn export_config(&self) -> RoutingSnapshot {
        let inner = self.inner.lock().unwrap();
        let mut routes: Vec<RouteEntry> = inner
            .routes
            .iter()
            .map(|(&source, targets)| {
                let mut targets: Vec<DeviceId> = targets.iter().copied().collect();
                targets.sort();
                RouteEntry { source, targets }
            })
            .collect();
        routes.sort_by_key(|entry| entry.source);

        let mut broadcast: Vec<DeviceId> = inner.broadcast.iter().copied().collect();
        broadcast.sort();
        let mut muted: Vec<DeviceId> = inner.muted.iter().copied().collect();
        muted.sort();

        RoutingSnapshot {
            routes,
            broadcast,
            muted,
        }
    }

    /// Clear-then-apply import. Not transactional: the clear happens
    /// first, so a snapshot that fails to apply leaves the engine empty.
    pub fn import_config(&self, snapshot: &RoutingSnapshot) {
        let mut inner = self.inner.lock().unwrap();
        inner.routes.clear();
        inner.broadcast.clear();
        inner.muted.clear();
        for entry in &snapshot.routes {
            if !entry.targets.is_empty() {
                inner
                    .routes
                    .insert(entry.source, entry.targets.iter().copied().collect());
            }
        }
        inner.broadcast.extend(snapshot.broadcast.iter().copied());
        inner.muted.extend(snapshot.muted.iter().copied());
        info!("routing configuration imported: {} sources", snapshot.routes.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioConfig, DeviceConfig};
    use crate::protocol::{PacketType, VIRTUAL_DEVICE};
    use std::time::Instant;
    use tokio::sync::broadcast;

    fn id(label: &str) -> DeviceId {
        DeviceId::new(label)
    }

    fn engine_with_devices(labels: &[&str]) -> RoutingEngine {
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
    fn test_set_and_remove_route() {
        let engine = engine_with_devices(&["001", "002"]);
        engine.set_route(id("001"), id("002"));
        assert_eq!(engine.routes_for(id("001")), vec![id("002")]);

        engine.remove_route(id("001"), id("002"));
        assert!(engine.routes_for(id("001")).is_empty());
        // Entry is gone entirely, matching the pre-SetRoute state
        assert!(engine.export_config().routes.is_empty());
    }

    #[test]
    fn test_self_route_echo() {
        let engine = engine_with_devices(&["001"]);
        engine.set_route(id("001"), id("001"));
        assert_eq!(engine.routes_for(id("001")), vec![id("001")]);
    }

    #[test]
    fn test_muted_source_routes_nowhere() {
        let engine = engine_with_devices(&["001", "002"]);
        engine.set_route(id("001"), id("002"));
        engine.mute(id("001"));
        assert!(engine.routes_for(id("001")).is_empty());
        engine.unmute(id("001"));
        assert_eq!(engine.routes_for(id("001")), vec![id("002")]);
    }

    #[test]
    fn test_muted_destination_excluded() {
        let engine = engine_with_devices(&["001", "002", "003"]);
        engine.set_routes(id("001"), [id("002"), id("003")]);
        engine.mute(id("002"));
        assert_eq!(engine.routes_for(id("001")), vec![id("003")]);
    }

    #[test]
    fn test_broadcast_targets() {
        let engine = engine_with_devices(&["001", "002", "003"]);
        engine.enable_broadcast(id("001"));
        engine.mute(id("003"));
        // Everyone online except the source and muted endpoints
        assert_eq!(engine.routes_for(id("001")), vec![id("002")]);

        engine.disable_broadcast(id("001"));
        assert!(engine.routes_for(id("001")).is_empty());
    }

    #[test]
    fn test_broadcast_bound() {
        let engine = engine_with_devices(&["001", "002", "003", "004"]);
        engine.enable_broadcast(id("001"));
        let online = 4;
        assert!(engine.routes_for(id("001")).len() <= online - 1);
    }

    #[test]
    fn test_bidirectional() {
        let engine = engine_with_devices(&["001", "002"]);
        engine.create_bidirectional(id("001"), id("002"));
        assert_eq!(engine.routes_for(id("001")), vec![id("002")]);
        assert_eq!(engine.routes_for(id("002")), vec![id("001")]);
    }

    #[test]
    fn test_conference() {
        let engine = engine_with_devices(&["001", "002", "003"]);
        engine
            .create_conference(&[id("001"), id("002"), id("003")])
            .unwrap();
        assert_eq!(engine.routes_for(id("001")), vec![id("002"), id("003")]);
        assert_eq!(engine.routes_for(id("002")), vec![id("001"), id("003")]);
        assert_eq!(engine.routes_for(id("003")), vec![id("001"), id("002")]);
    }

    #[test]
    fn test_conference_size_bound() {
        let (events, _) = broadcast::channel(64);
        let registry = Arc::new(DeviceRegistry::new(
            &DeviceConfig::default(),
            &AudioConfig::default(),
            events,
        ));
        let engine = RoutingEngine::new(registry, 2);
        let err = engine
            .create_conference(&[id("001"), id("002"), id("003")])
            .unwrap_err();
        assert!(matches!(err, RoutingError::GroupTooLarge { size: 3, max: 2 }));
    }

    #[test]
    fn test_group_comembers_routed() {
        let engine = engine_with_devices(&["001", "002", "003"]);
        engine.create_group("stage", &[id("001"), id("002")]).unwrap();
        assert_eq!(engine.routes_for(id("001")), vec![id("002")]);
        assert_eq!(engine.groups_of(id("002")), vec!["stage".to_string()]);

        engine.leave_group("stage", id("002"));
        assert!(engine.routes_for(id("001")).is_empty());
        engine.leave_group("stage", id("001"));
        assert!(engine.groups_of(id("001")).is_empty());
    }

    #[test]
    fn test_export_import_round_trip() {
        let engine = engine_with_devices(&["001", "002", "003"]);
        engine.set_routes(id("001"), [id("002"), id("003")]);
        engine.enable_broadcast(id("002"));
        engine.mute(id("003"));

        let exported = engine.export_config();
        engine.reset(true);
        assert!(engine.export_config().routes.is_empty());

        engine.import_config(&exported);
        assert_eq!(engine.export_config(), exported);
    }

    #[test]
    fn test_routing_matrix() {
        let engine = engine_with_devices(&["001", "002"]);
        engine.registry.register_virtual(VIRTUAL_DEVICE);
        engine.set_route(id("001"), id("002"));
        engine.mute(id("002"));

        let matrix = engine.routing_matrix();
        assert_eq!(matrix.len(), 3);
        let row = &matrix[&id("001")];
        assert!(row.online);
        assert!(!row.muted);
        assert!(row.routes.is_empty()); // 002 is muted
        assert!(matrix[&id("002")].muted);
        assert!(matrix[&VIRTUAL_DEVICE].online);
    }
}
