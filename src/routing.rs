// routing.rs - Routing Table
//
//! Maps agent identities to the ports they are reachable on.
//!
//! The table itself is plain data; the Router guards it with a lock and is
//! the only writer.

use crate::address::{AgentAddress, AgentId, ConnectorKind, Port};
use std::collections::HashMap;

/// Identity to port mapping
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: HashMap<AgentId, Vec<Port>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reachable port. Returns `false` if it was already present.
    pub fn insert(&mut self, id: AgentId, port: Port) -> bool {
        let ports = self.routes.entry(id).or_default();
        if ports.contains(&port) {
            return false;
        }
        ports.push(port);
        true
    }

    /// Remove every port of `kind` for an agent. Returns the removed ports.
    /// An agent left without ports is dropped from the table.
    pub fn remove_kind(&mut self, id: &AgentId, kind: ConnectorKind) -> Vec<Port> {
        let Some(ports) = self.routes.get_mut(id) else {
            return vec![];
        };
        let (removed, kept): (Vec<Port>, Vec<Port>) =
            ports.drain(..).partition(|p| p.kind() == kind);
        *ports = kept;
        if ports.is_empty() {
            self.routes.remove(id);
        }
        removed
    }

    /// Drop an agent entirely
    pub fn remove_agent(&mut self, id: &AgentId) -> Option<Vec<Port>> {
        self.routes.remove(id)
    }

    /// Replace an agent's ports wholesale
    pub fn replace(&mut self, address: AgentAddress) {
        let mut ports: Vec<Port> = Vec::with_capacity(address.ports.len());
        for port in address.ports {
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
        if ports.is_empty() {
            self.routes.remove(&address.id);
        } else {
            self.routes.insert(address.id, ports);
        }
    }

    /// Remove every port belonging to a connector kind (connector closed).
    /// Returns how many ports were pruned.
    pub fn prune_kind(&mut self, kind: ConnectorKind) -> usize {
        let mut pruned = 0;
        self.routes.retain(|_, ports| {
            let before = ports.len();
            ports.retain(|p| p.kind() != kind);
            pruned += before - ports.len();
            !ports.is_empty()
        });
        pruned
    }

    /// Snapshot of an agent's ports ordered by `priority`.
    ///
    /// Kinds missing from `priority` sort last, in registration order.
    pub fn resolve(&self, id: &AgentId, priority: &[ConnectorKind]) -> Vec<Port> {
        let Some(ports) = self.routes.get(id) else {
            return vec![];
        };
        let rank = |p: &Port| {
            priority
                .iter()
                .position(|k| *k == p.kind())
                .unwrap_or(priority.len())
        };
        let mut ordered = ports.clone();
        ordered.sort_by_key(rank);
        ordered
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.routes.contains_key(id)
    }

    pub fn ports(&self, id: &AgentId) -> Option<&[Port]> {
        self.routes.get(id).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentId> {
        self.routes.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NodeId;

    const DEFAULT_PRIORITY: [ConnectorKind; 4] = ConnectorKind::ALL;

    fn platform_port() -> Port {
        Port::Platform("10.0.0.2:7000".parse().unwrap())
    }

    #[test]
    fn test_insert_idempotent() {
        let mut table = RoutingTable::new();
        assert!(table.insert("heater".parse().unwrap(), Port::ZigBee(NodeId(4))));
        assert!(!table.insert("heater".parse().unwrap(), Port::ZigBee(NodeId(4))));
        assert_eq!(table.ports(&"heater".parse().unwrap()).unwrap().len(), 1);
    }

    #[test]
    fn test_resolve_orders_by_priority() {
        let mut table = RoutingTable::new();
        let id: AgentId = "heater".parse().unwrap();
        table.insert(id.clone(), Port::ZigBee(NodeId(4)));
        table.insert(id.clone(), platform_port());

        let ports = table.resolve(&id, &DEFAULT_PRIORITY);
        assert_eq!(ports[0].kind(), ConnectorKind::Platform);
        assert_eq!(ports[1].kind(), ConnectorKind::ZigBee);

        let radio_first = table.resolve(&id, &[ConnectorKind::ZigBee]);
        assert_eq!(radio_first[0].kind(), ConnectorKind::ZigBee);
        assert_eq!(radio_first[1].kind(), ConnectorKind::Platform);
    }

    #[test]
    fn test_remove_last_kind_takes_agent_offline() {
        let mut table = RoutingTable::new();
        let id: AgentId = "heater".parse().unwrap();
        table.insert(id.clone(), Port::ZigBee(NodeId(4)));
        table.insert(id.clone(), platform_port());

        assert_eq!(table.remove_kind(&id, ConnectorKind::Platform).len(), 1);
        assert!(table.contains(&id));
        assert_eq!(table.remove_kind(&id, ConnectorKind::ZigBee).len(), 1);
        assert!(!table.contains(&id));
        assert!(table.resolve(&id, &DEFAULT_PRIORITY).is_empty());
    }

    #[test]
    fn test_prune_kind() {
        let mut table = RoutingTable::new();
        table.insert("a".parse().unwrap(), Port::ZigBee(NodeId(1)));
        table.insert("b".parse().unwrap(), Port::ZigBee(NodeId(2)));
        table.insert("b".parse().unwrap(), platform_port());

        assert_eq!(table.prune_kind(ConnectorKind::ZigBee), 2);
        assert!(!table.contains(&"a".parse().unwrap()));
        assert_eq!(table.ports(&"b".parse().unwrap()).unwrap(), &[platform_port()]);
    }

    #[test]
    fn test_replace_with_no_ports_removes() {
        let mut table = RoutingTable::new();
        table.insert("a".parse().unwrap(), Port::ZigBee(NodeId(1)));
        table.replace(AgentAddress::new("a".parse().unwrap()));
        assert!(table.is_empty());
    }
}
